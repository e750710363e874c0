use thiserror::Error;

/// Daemon reachability failures, mapped to the category the caller
/// can show a user.
#[derive(Debug, Error)]
pub enum TransportError {
  #[error("The daemon socket is unavailable: {0}")]
  SocketUnavailable(String),
  #[error("The connection was reset by the daemon: {0}")]
  ConnectionReset(String),
  #[error("The call timed out: {0}")]
  Timeout(String),
  #[error("The daemon host could not be resolved: {0}")]
  Dns(String),
  #[error("The daemon host is unreachable: {0}")]
  HostUnreachable(String),
  #[error("No agent is connected for environment {environment_id}")]
  AgentNotConnected { environment_id: String },
  #[error("Not found: {0}")]
  NotFound(String),
  #[error("The daemon returned {status}: {message}")]
  Status { status: u16, message: String },
  #[error("Malformed daemon response: {0}")]
  Protocol(String),
  #[error("{0}")]
  Generic(String),
}

impl TransportError {
  pub fn from_io(e: &std::io::Error, unix_socket: bool) -> Self {
    use std::io::ErrorKind::*;
    let msg = e.to_string();
    match e.kind() {
      NotFound | PermissionDenied if unix_socket => {
        TransportError::SocketUnavailable(msg)
      }
      ConnectionReset | BrokenPipe => {
        TransportError::ConnectionReset(msg)
      }
      TimedOut => TransportError::Timeout(msg),
      ConnectionRefused | HostUnreachable | NetworkUnreachable => {
        TransportError::HostUnreachable(msg)
      }
      _ => TransportError::Generic(msg),
    }
  }

  pub fn from_bollard(
    e: bollard::errors::Error,
    unix_socket: bool,
  ) -> Self {
    use bollard::errors::Error::*;
    match e {
      DockerResponseServerError {
        status_code: 404,
        message,
      } => TransportError::NotFound(message),
      DockerResponseServerError {
        status_code,
        message,
      } => TransportError::Status {
        status: status_code,
        message,
      },
      IOError { err } => TransportError::from_io(&err, unix_socket),
      RequestTimeoutError => {
        TransportError::Timeout(String::from("request deadline hit"))
      }
      HyperResponseError { err } => {
        let msg = err.to_string();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("timed out") || lower.contains("timeout")
        {
          TransportError::Timeout(msg)
        } else if lower.contains("dns")
          || lower.contains("failed to lookup")
        {
          TransportError::Dns(msg)
        } else if lower.contains("connection reset")
          || lower.contains("broken pipe")
        {
          TransportError::ConnectionReset(msg)
        } else if lower.contains("connect") {
          if unix_socket {
            TransportError::SocketUnavailable(msg)
          } else {
            TransportError::HostUnreachable(msg)
          }
        } else {
          TransportError::Generic(msg)
        }
      }
      JsonDataError { message, .. } => {
        TransportError::Protocol(message)
      }
      other => TransportError::Generic(format!("{other}")),
    }
  }

  pub fn from_reqwest(e: reqwest::Error) -> Self {
    let msg = format!("{e}");
    if e.is_timeout() {
      TransportError::Timeout(msg)
    } else if msg.contains("dns error")
      || msg.contains("failed to lookup")
    {
      TransportError::Dns(msg)
    } else if e.is_connect() {
      TransportError::HostUnreachable(msg)
    } else if e.is_decode() {
      TransportError::Protocol(msg)
    } else {
      TransportError::Generic(msg)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn io(kind: std::io::ErrorKind) -> std::io::Error {
    std::io::Error::new(kind, "boom")
  }

  #[test]
  fn missing_unix_socket_maps_to_socket_unavailable() {
    let e = TransportError::from_io(
      &io(std::io::ErrorKind::NotFound),
      true,
    );
    assert!(matches!(e, TransportError::SocketUnavailable(_)));
  }

  #[test]
  fn missing_file_over_tcp_is_generic() {
    let e = TransportError::from_io(
      &io(std::io::ErrorKind::NotFound),
      false,
    );
    assert!(matches!(e, TransportError::Generic(_)));
  }

  #[test]
  fn reset_and_refused_map_to_their_categories() {
    assert!(matches!(
      TransportError::from_io(
        &io(std::io::ErrorKind::ConnectionReset),
        false
      ),
      TransportError::ConnectionReset(_)
    ));
    assert!(matches!(
      TransportError::from_io(
        &io(std::io::ErrorKind::ConnectionRefused),
        false
      ),
      TransportError::HostUnreachable(_)
    ));
    assert!(matches!(
      TransportError::from_io(
        &io(std::io::ErrorKind::TimedOut),
        false
      ),
      TransportError::Timeout(_)
    ));
  }

  #[test]
  fn daemon_404_is_not_found() {
    let e = TransportError::from_bollard(
      bollard::errors::Error::DockerResponseServerError {
        status_code: 404,
        message: "no such container".into(),
      },
      false,
    );
    assert!(matches!(e, TransportError::NotFound(_)));
  }
}
