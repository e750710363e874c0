//! Typed daemon operations on top of a [DaemonClient]. Local
//! transports go through bollard directly; agent transports issue the
//! equivalent raw api call and decode into the same bollard models.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::router::{
  Connection, DEFAULT_CALL_TIMEOUT, DaemonClient, TransportError,
};

mod containers;
mod demux;
mod images;
mod system;

pub use demux::demux_output;

/// Streaming calls (pull, events, logs) get a longer leash.
pub const STREAM_CALL_TIMEOUT: Duration = Duration::from_secs(300);

pub struct RawResponse {
  pub status: u16,
  pub body: Bytes,
}

impl DaemonClient {
  pub(crate) fn map_err(
    &self,
    e: bollard::errors::Error,
  ) -> TransportError {
    TransportError::from_bollard(e, self.unix_socket)
  }

  /// Issue a raw daemon api call over an agent transport.
  /// Local transports never take this path.
  pub(crate) async fn raw(
    &self,
    method: &str,
    path: &str,
    body: Option<Value>,
    timeout: Duration,
    streaming: bool,
  ) -> Result<RawResponse, TransportError> {
    crate::router::timed(
      &self.environment_name,
      &format!("{method} {path}"),
      self.raw_inner(method, path, body, timeout, streaming),
    )
    .await
  }

  async fn raw_inner(
    &self,
    method: &str,
    path: &str,
    body: Option<Value>,
    timeout: Duration,
    streaming: bool,
  ) -> Result<RawResponse, TransportError> {
    match &self.connection {
      Connection::Local(_) => Err(TransportError::Generic(
        String::from("raw calls are not routed over local transport"),
      )),
      Connection::AgentHttp { client, base_url } => {
        let method = reqwest::Method::from_bytes(method.as_bytes())
          .map_err(|_| {
            TransportError::Generic(format!(
              "invalid method {method}"
            ))
          })?;
        let mut req = client
          .request(method, format!("{base_url}{path}"))
          .timeout(timeout);
        if let Some(body) = body {
          req = req.json(&body);
        }
        let resp =
          req.send().await.map_err(TransportError::from_reqwest)?;
        let status = resp.status().as_u16();
        let body = resp
          .bytes()
          .await
          .map_err(TransportError::from_reqwest)?;
        check_status(status, &body)?;
        Ok(RawResponse { status, body })
      }
      Connection::Edge => {
        let res = crate::gateway::edge_request(
          &self.environment_id,
          method,
          path,
          body,
          timeout,
          streaming,
        )
        .await?;
        check_status(res.status, &res.body)?;
        Ok(res)
      }
    }
  }

  pub(crate) async fn raw_json<T: DeserializeOwned>(
    &self,
    method: &str,
    path: &str,
    body: Option<Value>,
    timeout: Duration,
  ) -> Result<T, TransportError> {
    let res = self.raw(method, path, body, timeout, false).await?;
    serde_json::from_slice(&res.body).map_err(|e| {
      TransportError::Protocol(format!(
        "failed to decode {path} response | {e}"
      ))
    })
  }

  pub(crate) async fn raw_unit(
    &self,
    method: &str,
    path: &str,
    body: Option<Value>,
  ) -> Result<(), TransportError> {
    self
      .raw(method, path, body, DEFAULT_CALL_TIMEOUT, false)
      .await
      .map(|_| ())
  }
}

fn check_status(
  status: u16,
  body: &[u8],
) -> Result<(), TransportError> {
  if status < 400 {
    return Ok(());
  }
  let message = serde_json::from_slice::<Value>(body)
    .ok()
    .and_then(|v| {
      v.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
    })
    .unwrap_or_else(|| {
      String::from_utf8_lossy(body).trim().to_string()
    });
  if status == 404 {
    Err(TransportError::NotFound(message))
  } else {
    Err(TransportError::Status { status, message })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn check_status_extracts_daemon_message() {
    let body = br#"{"message":"No such container: foo"}"#;
    match check_status(404, body) {
      Err(TransportError::NotFound(msg)) => {
        assert_eq!(msg, "No such container: foo")
      }
      other => panic!("unexpected: {other:?}"),
    }
    match check_status(500, b"plain failure") {
      Err(TransportError::Status { status, message }) => {
        assert_eq!(status, 500);
        assert_eq!(message, "plain failure");
      }
      other => panic!("unexpected: {other:?}"),
    }
    assert!(check_status(204, b"").is_ok());
  }
}
