//! WebSocket server for reverse-tunnel agents. Agents dial in, prove
//! a token in their hello frame, and from then on the core forwards
//! daemon api calls to them as correlated request / response /
//! stream frames.

use std::{sync::Arc, time::Duration};

use axum::{
  Router,
  extract::{
    WebSocketUpgrade,
    ws::{Message, WebSocket},
  },
  response::Response,
  routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use stevedore_client::{
  entities::{
    environment::AgentInfo, event::EnvStatus, stevedore_timestamp,
  },
  ws::{CloseReason, EdgeMessage, HEARTBEAT_TIMEOUT_SECS},
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
  docker::RawResponse,
  notify::{NotificationKind, notify_best_effort},
  router::TransportError,
  state::{broker, store},
  tokens::validate_agent_token,
  workers::events::DedupCache,
};

mod connection;
mod dispatch;

pub use connection::{
  AgentResponse, EdgeConnection, WaiterError, edge_connections,
};

const HELLO_TIMEOUT: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub fn router() -> Router {
  Router::new().route("/agent", get(handler))
}

async fn handler(ws: WebSocketUpgrade) -> Response {
  ws.on_upgrade(handle_agent_socket)
}

async fn handle_agent_socket(mut socket: WebSocket) {
  // First frame must be the hello.
  let hello = match tokio::time::timeout(
    HELLO_TIMEOUT,
    socket.recv(),
  )
  .await
  {
    Ok(Some(Ok(Message::Text(text)))) => {
      match EdgeMessage::from_json_str(&text) {
        Ok(EdgeMessage::Hello {
          version,
          agent_id,
          agent_name,
          token,
          docker_version,
          hostname,
          capabilities,
        }) => (
          version,
          agent_id,
          agent_name,
          token,
          docker_version,
          hostname,
          capabilities,
        ),
        Ok(other) => {
          debug!("agent sent {other:?} before hello");
          close_with_error(socket, "expected hello frame").await;
          return;
        }
        Err(e) => {
          close_with_error(
            socket,
            &format!("malformed hello frame: {e}"),
          )
          .await;
          return;
        }
      }
    }
    Ok(_) => {
      close_with_error(socket, "expected a text hello frame").await;
      return;
    }
    Err(_) => {
      close_with_error(socket, "hello timed out").await;
      return;
    }
  };
  let (
    version,
    agent_id,
    agent_name,
    token,
    docker_version,
    hostname,
    capabilities,
  ) = hello;

  let environment = match validate_agent_token(&token).await {
    Ok(environment) => environment,
    Err(e) => {
      info!("agent {agent_name} rejected | {e:#}");
      close_with_error(socket, "invalid token").await;
      return;
    }
  };

  let agent = AgentInfo {
    agent_id,
    agent_name,
    agent_version: version,
    capabilities,
    last_seen: stevedore_timestamp(),
  };
  if let Err(e) = store()
    .environments()
    .update_agent_info(&environment.id, agent.clone())
    .await
  {
    warn!(
      "failed to persist agent info for {} | {e:#}",
      environment.name
    );
  }

  let (sender, receiver) = mpsc::unbounded_channel::<Message>();
  let conn = Arc::new(EdgeConnection::new(
    environment.id.clone(),
    environment.name.clone(),
    agent,
    sender,
  ));

  // One connection per environment. A newer hello wins.
  if let Some(prior) =
    edge_connections().insert(environment.id.clone(), conn.clone())
  {
    info!(
      "agent connection for {} replaced by {}",
      environment.name, conn.agent.agent_name
    );
    prior.reject_all(CloseReason::Replaced);
    prior.send_close_frame("Replaced by new connection");
  }

  if let Err(e) = conn.send(&EdgeMessage::Welcome {
    environment_id: environment.id.clone(),
    message: None,
  }) {
    warn!("failed to send welcome to {} | {e:#}", environment.name);
  }

  info!(
    "agent {} connected for environment {} (docker {:?}, host {:?})",
    conn.agent.agent_name, environment.name, docker_version, hostname
  );
  publish_status(&environment.id, &environment.name, true, None)
    .await;

  let (mut sink, mut stream) = socket.split();

  // The writer task owns the sink; everyone else goes through the
  // connection's channel.
  let writer = tokio::spawn(async move {
    let mut receiver = receiver;
    while let Some(msg) = receiver.recv().await {
      let closing = matches!(msg, Message::Close(_));
      if sink.send(msg).await.is_err() || closing {
        break;
      }
    }
  });

  let mut dedup = DedupCache::default();
  while let Some(msg) = stream.next().await {
    match msg {
      Ok(Message::Text(text)) => {
        match EdgeMessage::from_json_str(&text) {
          Ok(frame) => {
            dispatch::handle_frame(&conn, frame, &mut dedup).await
          }
          Err(e) => {
            // Malformed frames are logged and dropped, never fatal.
            warn!(
              "malformed frame from {} | {e}",
              conn.agent.agent_name
            );
          }
        }
      }
      Ok(Message::Ping(_) | Message::Pong(_)) => {
        conn.touch_heartbeat()
      }
      Ok(Message::Close(_)) | Err(_) => break,
      Ok(_) => {}
    }
  }

  writer.abort();
  // Only tear down if this connection is still the registered one;
  // a replacement already cleaned up after itself.
  let removed = edge_connections()
    .remove_if(&environment.id, |_, current| {
      Arc::ptr_eq(current, &conn)
    })
    .is_some();
  conn.reject_all(CloseReason::ConnectionClosed);
  if removed {
    info!(
      "agent disconnected from environment {}",
      environment.name
    );
    publish_status(&environment.id, &environment.name, false, None)
      .await;
  }
}

async fn close_with_error(mut socket: WebSocket, error: &str) {
  let frame = EdgeMessage::Error {
    request_id: None,
    error: error.to_string(),
    code: None,
  };
  if let Ok(text) = frame.to_json_string() {
    let _ = socket.send(Message::text(text)).await;
  }
  let _ = socket.close().await;
}

async fn publish_status(
  environment_id: &str,
  name: &str,
  online: bool,
  error: Option<String>,
) {
  broker().publish_env_status(EnvStatus {
    environment_id: environment_id.to_string(),
    name: name.to_string(),
    online,
    error: error.clone(),
  });
  let kind = if online {
    NotificationKind::EnvironmentOnline
  } else {
    NotificationKind::EnvironmentOffline
  };
  notify_best_effort(
    kind,
    json!({ "environment": name, "error": error }),
    Some(environment_id),
  )
  .await;
}

/// Close the connection for an environment, eg when the environment
/// is deleted. Idempotent.
pub fn close_connection(
  environment_id: &str,
  reason: CloseReason,
) {
  if let Some((_, conn)) = edge_connections().remove(environment_id)
  {
    conn.reject_all(reason);
    conn.send_close_frame(&reason.to_string());
  }
}

/// Scans for connections that stopped heartbeating and closes them,
/// rejecting all of their waiters.
pub fn spawn_heartbeat_sweep() {
  tokio::spawn(async move {
    let timeout_ms = HEARTBEAT_TIMEOUT_SECS as i64 * 1000;
    loop {
      tokio::time::sleep(SWEEP_INTERVAL).await;
      let now = stevedore_timestamp();
      let dead = edge_connections()
        .iter()
        .filter(|entry| {
          now - entry.value().last_heartbeat() > timeout_ms
        })
        .map(|entry| entry.key().clone())
        .collect::<Vec<_>>();
      for environment_id in dead {
        let Some((_, conn)) =
          edge_connections().remove(&environment_id)
        else {
          continue;
        };
        warn!(
          "agent for environment {} missed heartbeats, closing",
          conn.environment_name
        );
        conn.reject_all(CloseReason::Timeout);
        conn.send_close_frame("Heartbeat timeout");
        publish_status(
          &environment_id,
          &conn.environment_name,
          false,
          Some(String::from("agent heartbeat timeout")),
        )
        .await;
      }
    }
  });
}

/// Forward one daemon api call over the environment's agent
/// connection. Fails fast when no agent is connected.
pub async fn edge_request(
  environment_id: &str,
  method: &str,
  path: &str,
  body: Option<Value>,
  timeout: Duration,
  streaming: bool,
) -> Result<RawResponse, TransportError> {
  let conn = edge_connections()
    .get(environment_id)
    .map(|entry| entry.value().clone())
    .ok_or_else(|| TransportError::AgentNotConnected {
      environment_id: environment_id.to_string(),
    })?;

  let request_id = Uuid::new_v4().to_string();
  let frame = EdgeMessage::Request {
    request_id: request_id.clone(),
    method: method.to_string(),
    path: path.to_string(),
    headers: json!({}),
    body: body.map(|b| b.to_string()),
    streaming,
  };

  let result = if streaming {
    let (req_rx, stream_rx) = conn.register_stream(&request_id);
    if let Err(e) = conn.send(&frame) {
      conn.forget(&request_id);
      return Err(TransportError::Generic(format!("{e:#}")));
    }
    tokio::time::timeout(timeout, async {
      tokio::select! {
        res = req_rx => res.map_err(|_| dropped())?.map(|r| RawResponse { status: r.status, body: r.body }),
        res = stream_rx => res.map_err(|_| dropped())?.map(|body| RawResponse { status: 200, body }),
      }
    })
    .await
  } else {
    let req_rx = conn.register_request(&request_id);
    if let Err(e) = conn.send(&frame) {
      conn.forget(&request_id);
      return Err(TransportError::Generic(format!("{e:#}")));
    }
    tokio::time::timeout(timeout, async {
      req_rx
        .await
        .map_err(|_| dropped())?
        .map(|r| RawResponse { status: r.status, body: r.body })
    })
    .await
  };

  match result {
    Ok(res) => {
      conn.forget(&request_id);
      res.map_err(waiter_to_transport)
    }
    Err(_) => {
      // Deadline hit: deterministically remove the waiter, then try
      // to cancel on the agent side.
      conn.forget(&request_id);
      connection::send_cancel(&conn, &request_id);
      Err(TransportError::Timeout(format!(
        "agent did not answer {method} {path} within {}s",
        timeout.as_secs()
      )))
    }
  }
}

fn dropped() -> WaiterError {
  WaiterError::Closed(CloseReason::ConnectionClosed)
}

fn waiter_to_transport(e: WaiterError) -> TransportError {
  match e {
    WaiterError::Closed(CloseReason::Timeout) => {
      TransportError::Timeout(String::from(
        "agent connection timed out",
      ))
    }
    WaiterError::Closed(reason) => TransportError::ConnectionReset(
      format!("agent connection closed: {reason}"),
    ),
    WaiterError::Agent(message) => {
      TransportError::Generic(message)
    }
  }
}
