use std::collections::HashMap;

use bollard::{
  models::{
    EventMessage, SystemDataUsageResponse, SystemInfo, SystemVersion,
  },
  query_parameters::{DataUsageOptions, EventsOptions},
};
use futures::{Stream, StreamExt, stream::BoxStream};

use crate::router::{
  Connection, DEFAULT_CALL_TIMEOUT, DaemonClient, TransportError,
};

impl DaemonClient {
  pub async fn info(&self) -> Result<SystemInfo, TransportError> {
    match &self.connection {
      Connection::Local(docker) => {
        docker.info().await.map_err(|e| self.map_err(e))
      }
      _ => {
        self
          .raw_json("GET", "/info", None, DEFAULT_CALL_TIMEOUT)
          .await
      }
    }
  }

  pub async fn version(
    &self,
  ) -> Result<SystemVersion, TransportError> {
    match &self.connection {
      Connection::Local(docker) => {
        docker.version().await.map_err(|e| self.map_err(e))
      }
      _ => {
        self
          .raw_json("GET", "/version", None, DEFAULT_CALL_TIMEOUT)
          .await
      }
    }
  }

  pub async fn disk_usage(
    &self,
  ) -> Result<SystemDataUsageResponse, TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .df(Option::<DataUsageOptions>::None)
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        self
          .raw_json("GET", "/system/df", None, DEFAULT_CALL_TIMEOUT)
          .await
      }
    }
  }

  /// Long lived container event stream. Edge environments never open
  /// one; their events arrive as agent frames instead.
  pub async fn container_event_stream(
    &self,
  ) -> Result<
    BoxStream<'static, Result<EventMessage, TransportError>>,
    TransportError,
  > {
    match &self.connection {
      Connection::Local(docker) => {
        let unix_socket = self.unix_socket;
        let filters = HashMap::from([(
          String::from("type"),
          vec![String::from("container")],
        )]);
        let stream = docker
          .events(Some(EventsOptions {
            filters: Some(filters),
            ..Default::default()
          }))
          .map(move |res| {
            res.map_err(|e| {
              TransportError::from_bollard(e, unix_socket)
            })
          });
        Ok(stream.boxed())
      }
      Connection::AgentHttp { client, base_url } => {
        let filters = urlencoding::encode(
          r#"{"type":["container"]}"#,
        )
        .into_owned();
        let resp = client
          .get(format!("{base_url}/events?filters={filters}"))
          .send()
          .await
          .map_err(TransportError::from_reqwest)?
          .error_for_status()
          .map_err(TransportError::from_reqwest)?;
        Ok(json_line_stream(resp.bytes_stream()).boxed())
      }
      Connection::Edge => Err(TransportError::Generic(String::from(
        "edge environments deliver events over the agent connection",
      ))),
    }
  }
}

/// Decode newline delimited JSON out of a byte stream.
fn json_line_stream<S>(
  inner: S,
) -> impl Stream<Item = Result<EventMessage, TransportError>> + Send
where
  S: Stream<Item = Result<bytes::Bytes, reqwest::Error>>
    + Send
    + Unpin
    + 'static,
{
  futures::stream::unfold(
    (inner, Vec::<u8>::new(), false),
    |(mut inner, mut buf, mut done)| async move {
      loop {
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
          let line: Vec<u8> = buf.drain(..=pos).collect();
          let line = String::from_utf8_lossy(&line);
          let line = line.trim();
          if line.is_empty() {
            continue;
          }
          let item = serde_json::from_str::<EventMessage>(line)
            .map_err(|e| {
              TransportError::Protocol(format!(
                "failed to decode event | {e}"
              ))
            });
          return Some((item, (inner, buf, done)));
        }
        if done {
          return None;
        }
        match inner.next().await {
          Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
          Some(Err(e)) => {
            return Some((
              Err(TransportError::from_reqwest(e)),
              (inner, buf, true),
            ));
          }
          None => done = true,
        }
      }
    },
  )
}
