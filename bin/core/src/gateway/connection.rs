use std::{
  collections::HashMap,
  sync::{
    Mutex, OnceLock,
    atomic::{AtomicI64, Ordering},
  },
};

use arc_swap::ArcSwapOption;
use axum::extract::ws::{Message, Utf8Bytes};
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use dashmap::DashMap;
use stevedore_client::{
  entities::{environment::AgentInfo, stevedore_timestamp},
  ws::{AgentMetrics, CloseReason, EdgeMessage},
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// At most one live connection per environment.
pub fn edge_connections()
-> &'static DashMap<String, std::sync::Arc<EdgeConnection>> {
  static CONNECTIONS: OnceLock<
    DashMap<String, std::sync::Arc<EdgeConnection>>,
  > = OnceLock::new();
  CONNECTIONS.get_or_init(Default::default)
}

#[derive(Debug)]
pub struct AgentResponse {
  pub status: u16,
  pub body: Bytes,
}

/// Why a waiter was rejected instead of resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaiterError {
  #[error("agent connection closed: {0}")]
  Closed(CloseReason),
  #[error("agent reported an error: {0}")]
  Agent(String),
}

type ResponseWaiter =
  oneshot::Sender<Result<AgentResponse, WaiterError>>;
type StreamWaiter = oneshot::Sender<Result<Bytes, WaiterError>>;

#[derive(Default)]
struct Waiters {
  requests: HashMap<String, ResponseWaiter>,
  streams: HashMap<String, StreamWaiter>,
  /// Accumulated stream frames per request id.
  buffers: HashMap<String, Vec<u8>>,
}

pub struct EdgeConnection {
  pub environment_id: String,
  pub environment_name: String,
  pub agent: AgentInfo,
  pub connected_at: i64,
  /// Latest raw metrics frame, for api reads.
  pub last_metrics: ArcSwapOption<AgentMetrics>,
  last_heartbeat: AtomicI64,
  sender: mpsc::UnboundedSender<Message>,
  waiters: Mutex<Waiters>,
}

impl EdgeConnection {
  pub fn new(
    environment_id: String,
    environment_name: String,
    agent: AgentInfo,
    sender: mpsc::UnboundedSender<Message>,
  ) -> EdgeConnection {
    EdgeConnection {
      environment_id,
      environment_name,
      agent,
      connected_at: stevedore_timestamp(),
      last_metrics: Default::default(),
      last_heartbeat: AtomicI64::new(stevedore_timestamp()),
      sender,
      waiters: Default::default(),
    }
  }

  pub fn touch_heartbeat(&self) {
    self
      .last_heartbeat
      .store(stevedore_timestamp(), Ordering::Relaxed);
  }

  pub fn last_heartbeat(&self) -> i64 {
    self.last_heartbeat.load(Ordering::Relaxed)
  }

  /// Best effort frame send; the writer task owns the socket.
  pub fn send(&self, msg: &EdgeMessage) -> anyhow::Result<()> {
    let text = msg.to_json_string()?;
    self
      .sender
      .send(Message::Text(Utf8Bytes::from(text)))
      .map_err(|_| anyhow::anyhow!("agent writer task is gone"))
  }

  pub fn send_close_frame(&self, reason: &str) {
    let _ = self.sender.send(Message::Close(Some(
      axum::extract::ws::CloseFrame {
        code: 1000,
        reason: Utf8Bytes::from(reason.to_string()),
      },
    )));
  }

  /// Register a waiter for a non streaming request.
  pub fn register_request(
    &self,
    request_id: &str,
  ) -> oneshot::Receiver<Result<AgentResponse, WaiterError>> {
    let (tx, rx) = oneshot::channel();
    self
      .waiters
      .lock()
      .unwrap()
      .requests
      .insert(request_id.to_string(), tx);
    rx
  }

  /// Register both a response waiter (error responses can arrive
  /// instead of a stream) and the stream accumulator.
  pub fn register_stream(
    &self,
    request_id: &str,
  ) -> (
    oneshot::Receiver<Result<AgentResponse, WaiterError>>,
    oneshot::Receiver<Result<Bytes, WaiterError>>,
  ) {
    let (req_tx, req_rx) = oneshot::channel();
    let (stream_tx, stream_rx) = oneshot::channel();
    let mut waiters = self.waiters.lock().unwrap();
    waiters.requests.insert(request_id.to_string(), req_tx);
    waiters.streams.insert(request_id.to_string(), stream_tx);
    waiters.buffers.insert(request_id.to_string(), Vec::new());
    (req_rx, stream_rx)
  }

  /// Drop every trace of a request, eg after its deadline.
  pub fn forget(&self, request_id: &str) {
    let mut waiters = self.waiters.lock().unwrap();
    waiters.requests.remove(request_id);
    waiters.streams.remove(request_id);
    waiters.buffers.remove(request_id);
  }

  /// Resolve the response waiter. Late or unknown ids are dropped.
  pub fn resolve_response(
    &self,
    request_id: &str,
    status: u16,
    body: Option<&str>,
    is_binary: bool,
  ) {
    let waiter = {
      self.waiters.lock().unwrap().requests.remove(request_id)
    };
    let Some(waiter) = waiter else {
      debug!("response for unknown request {request_id}, dropping");
      return;
    };
    let body = match body {
      Some(body) if is_binary => match STANDARD.decode(body) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
          warn!(
            "invalid base64 body for request {request_id} | {e}"
          );
          Bytes::new()
        }
      },
      Some(body) => Bytes::from(body.to_string()),
      None => Bytes::new(),
    };
    let _ = waiter.send(Ok(AgentResponse { status, body }));
  }

  /// Append one stream frame to the request's buffer.
  pub fn append_stream(
    &self,
    request_id: &str,
    data: &str,
    is_binary: bool,
  ) {
    let mut waiters = self.waiters.lock().unwrap();
    let Some(buf) = waiters.buffers.get_mut(request_id) else {
      debug!(
        "stream frame for unknown request {request_id}, dropping"
      );
      return;
    };
    if is_binary {
      match STANDARD.decode(data) {
        Ok(bytes) => buf.extend_from_slice(&bytes),
        Err(e) => warn!(
          "invalid base64 stream frame for {request_id} | {e}"
        ),
      }
    } else {
      buf.extend_from_slice(data.as_bytes());
    }
  }

  /// Resolve the stream waiter with the aggregated body.
  pub fn end_stream(
    &self,
    request_id: &str,
    reason: Option<&str>,
  ) {
    let (waiter, buf) = {
      let mut waiters = self.waiters.lock().unwrap();
      (
        waiters.streams.remove(request_id),
        waiters.buffers.remove(request_id).unwrap_or_default(),
      )
    };
    let Some(waiter) = waiter else {
      debug!(
        "stream end for unknown request {request_id}, dropping"
      );
      return;
    };
    let res = match reason {
      Some("cancelled") => {
        Err(WaiterError::Closed(CloseReason::Cancelled))
      }
      _ => Ok(Bytes::from(buf)),
    };
    let _ = waiter.send(res);
  }

  /// Reject a single request, eg on an error frame.
  pub fn reject_request(
    &self,
    request_id: &str,
    reason: WaiterError,
  ) {
    let (req, stream) = {
      let mut waiters = self.waiters.lock().unwrap();
      waiters.buffers.remove(request_id);
      (
        waiters.requests.remove(request_id),
        waiters.streams.remove(request_id),
      )
    };
    if let Some(waiter) = req {
      let _ = waiter.send(Err(reason.clone()));
    }
    if let Some(waiter) = stream {
      let _ = waiter.send(Err(reason));
    }
  }

  /// Reject every pending waiter exactly once. Draining the maps
  /// makes a second close a no-op.
  pub fn reject_all(&self, reason: CloseReason) {
    let (requests, streams) = {
      let mut waiters = self.waiters.lock().unwrap();
      waiters.buffers.clear();
      (
        std::mem::take(&mut waiters.requests),
        std::mem::take(&mut waiters.streams),
      )
    };
    for (_, waiter) in requests {
      let _ = waiter.send(Err(WaiterError::Closed(reason)));
    }
    for (_, waiter) in streams {
      let _ = waiter.send(Err(WaiterError::Closed(reason)));
    }
  }

  #[cfg(test)]
  pub fn pending_counts(&self) -> (usize, usize) {
    let waiters = self.waiters.lock().unwrap();
    (waiters.requests.len(), waiters.streams.len())
  }
}

/// Send a best effort cancel for a request the core gave up on.
pub fn send_cancel(conn: &EdgeConnection, request_id: &str) {
  let _ = conn.send(&EdgeMessage::StreamEnd {
    request_id: request_id.to_string(),
    reason: Some(CloseReason::Cancelled.to_string()),
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_conn() -> (
    EdgeConnection,
    mpsc::UnboundedReceiver<Message>,
  ) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
      EdgeConnection::new(
        "env1".to_string(),
        "env one".to_string(),
        AgentInfo::default(),
        tx,
      ),
      rx,
    )
  }

  #[tokio::test]
  async fn response_resolves_waiter_once() {
    let (conn, _rx) = test_conn();
    let waiter = conn.register_request("r1");
    conn.resolve_response("r1", 200, Some("ok"), false);
    let res = waiter.await.unwrap().unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body, Bytes::from("ok"));
    // A second response for the same id finds no waiter.
    conn.resolve_response("r1", 500, None, false);
    assert_eq!(conn.pending_counts(), (0, 0));
  }

  #[tokio::test]
  async fn binary_bodies_are_base64_decoded() {
    let (conn, _rx) = test_conn();
    let waiter = conn.register_request("r1");
    conn.resolve_response("r1", 200, Some("aGVsbG8="), true);
    let res = waiter.await.unwrap().unwrap();
    assert_eq!(res.body, Bytes::from("hello"));
  }

  #[tokio::test]
  async fn stream_frames_accumulate_until_end() {
    let (conn, _rx) = test_conn();
    let (_req, stream) = conn.register_stream("r1");
    conn.append_stream("r1", "part one ", false);
    conn.append_stream("r1", "part two", false);
    conn.end_stream("r1", None);
    let body = stream.await.unwrap().unwrap();
    assert_eq!(body, Bytes::from("part one part two"));
  }

  #[tokio::test]
  async fn response_and_stream_end_never_both_resolve() {
    let (conn, _rx) = test_conn();
    let (req, stream) = conn.register_stream("r1");
    // An error response arrives instead of stream frames.
    conn.resolve_response("r1", 500, Some("boom"), false);
    assert_eq!(req.await.unwrap().unwrap().status, 500);
    // A late stream_end finds the buffer gone but the stream
    // waiter still pending; it resolves empty exactly once.
    conn.end_stream("r1", None);
    assert!(stream.await.unwrap().unwrap().is_empty());
    assert_eq!(conn.pending_counts(), (0, 0));
  }

  #[tokio::test]
  async fn cancelled_stream_rejects_with_cancelled() {
    let (conn, _rx) = test_conn();
    let (_req, stream) = conn.register_stream("r1");
    conn.end_stream("r1", Some("cancelled"));
    assert_eq!(
      stream.await.unwrap().unwrap_err(),
      WaiterError::Closed(CloseReason::Cancelled)
    );
  }

  #[tokio::test]
  async fn reject_all_rejects_every_waiter_exactly_once() {
    let (conn, _rx) = test_conn();
    let w1 = conn.register_request("r1");
    let w2 = conn.register_request("r2");
    let (w3, s3) = conn.register_stream("r3");
    conn.reject_all(CloseReason::Replaced);
    for waiter in [w1, w2, w3] {
      assert_eq!(
        waiter.await.unwrap().unwrap_err(),
        WaiterError::Closed(CloseReason::Replaced)
      );
    }
    assert_eq!(
      s3.await.unwrap().unwrap_err(),
      WaiterError::Closed(CloseReason::Replaced)
    );
    assert_eq!(conn.pending_counts(), (0, 0));
    // Idempotent.
    conn.reject_all(CloseReason::ConnectionClosed);
  }

  #[tokio::test]
  async fn forget_removes_all_traces() {
    let (conn, _rx) = test_conn();
    let (_w, _s) = conn.register_stream("r1");
    conn.forget("r1");
    assert_eq!(conn.pending_counts(), (0, 0));
  }
}
