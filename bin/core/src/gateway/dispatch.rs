//! Routes frames arriving on one agent connection.

use std::sync::Arc;

use stevedore_client::{
  entities::{
    event::HostMetric, stevedore_timestamp,
  },
  ws::{AgentMetrics, EdgeMessage},
};

use super::connection::{EdgeConnection, WaiterError};
use crate::{
  state::store,
  workers::events::{DedupCache, IncomingEvent, process_event},
};

pub async fn handle_frame(
  conn: &Arc<EdgeConnection>,
  frame: EdgeMessage,
  dedup: &mut DedupCache,
) {
  match frame {
    EdgeMessage::Ping { timestamp } => {
      conn.touch_heartbeat();
      let _ = conn.send(&EdgeMessage::Pong { timestamp });
    }
    EdgeMessage::Pong { .. } => conn.touch_heartbeat(),
    EdgeMessage::Response {
      request_id,
      status_code,
      body,
      is_binary,
      ..
    } => {
      conn.resolve_response(
        &request_id,
        status_code,
        body.as_deref(),
        is_binary,
      );
    }
    EdgeMessage::Stream {
      request_id,
      data,
      is_binary,
      ..
    } => {
      conn.append_stream(&request_id, &data, is_binary);
    }
    EdgeMessage::StreamEnd { request_id, reason } => {
      conn.end_stream(&request_id, reason.as_deref());
    }
    EdgeMessage::Error {
      request_id,
      error,
      code,
    } => match request_id {
      Some(request_id) => {
        conn
          .reject_request(&request_id, WaiterError::Agent(error));
      }
      None => warn!(
        "agent {} error | {error} | code: {code:?}",
        conn.agent.agent_name
      ),
    },
    EdgeMessage::Metrics { timestamp, metrics } => {
      handle_metrics(conn, timestamp, metrics).await;
    }
    EdgeMessage::ContainerEvent { event } => {
      process_event(
        &conn.environment_id,
        &conn.environment_name,
        IncomingEvent {
          container_id: event.container_id,
          container_name: event.container_name,
          image: event.image,
          action: event.action,
          actor_attributes: event.actor_attributes,
          timestamp: event.timestamp,
          time_nano: event.time_nano,
        },
        dedup,
      )
      .await;
    }
    EdgeMessage::ExecReady { .. }
    | EdgeMessage::ExecOutput { .. }
    | EdgeMessage::ExecEnd { .. } => {
      // Terminal sessions are bridged by the api surface, which
      // subscribes directly. Nothing to do inline.
      debug!(
        "exec frame from {} outside a session",
        conn.agent.agent_name
      );
    }
    EdgeMessage::Hello { .. }
    | EdgeMessage::Welcome { .. }
    | EdgeMessage::Request { .. }
    | EdgeMessage::ExecStart { .. }
    | EdgeMessage::ExecInput { .. }
    | EdgeMessage::ExecResize { .. } => {
      warn!(
        "unexpected {} frame from agent {}",
        frame_name(&frame),
        conn.agent.agent_name
      );
    }
  }
}

/// Host metrics arrive with the raw container cpu sum; normalize to
/// 0-100 across cores before persisting.
async fn handle_metrics(
  conn: &Arc<EdgeConnection>,
  timestamp: i64,
  metrics: AgentMetrics,
) {
  conn
    .last_metrics
    .store(Some(std::sync::Arc::new(metrics.clone())));
  if metrics.cpu_cores == 0 || metrics.memory_total == 0 {
    debug!(
      "dropping metrics without cores / memory from {}",
      conn.agent.agent_name
    );
    return;
  }
  let cpu_percent = metrics.cpu_usage / metrics.cpu_cores as f64;
  let memory_percent = metrics.memory_used as f64
    / metrics.memory_total as f64
    * 100.0;
  if !cpu_percent.is_finite()
    || cpu_percent < 0.0
    || !memory_percent.is_finite()
    || memory_percent < 0.0
  {
    debug!(
      "dropping non finite metrics from {}",
      conn.agent.agent_name
    );
    return;
  }
  let metric = HostMetric {
    environment_id: conn.environment_id.clone(),
    cpu_percent,
    memory_percent,
    memory_used: metrics.memory_used,
    memory_total: metrics.memory_total,
    timestamp: if timestamp > 0 {
      timestamp
    } else {
      stevedore_timestamp()
    },
  };
  if let Err(e) = store().host_metrics().insert(metric).await {
    warn!(
      "failed to persist metrics for {} | {e:#}",
      conn.environment_name
    );
  }
}

fn frame_name(frame: &EdgeMessage) -> &'static str {
  match frame {
    EdgeMessage::Hello { .. } => "hello",
    EdgeMessage::Welcome { .. } => "welcome",
    EdgeMessage::Request { .. } => "request",
    EdgeMessage::Response { .. } => "response",
    EdgeMessage::Stream { .. } => "stream",
    EdgeMessage::StreamEnd { .. } => "stream_end",
    EdgeMessage::Metrics { .. } => "metrics",
    EdgeMessage::ContainerEvent { .. } => "container_event",
    EdgeMessage::ExecStart { .. } => "exec_start",
    EdgeMessage::ExecReady { .. } => "exec_ready",
    EdgeMessage::ExecInput { .. } => "exec_input",
    EdgeMessage::ExecOutput { .. } => "exec_output",
    EdgeMessage::ExecResize { .. } => "exec_resize",
    EdgeMessage::ExecEnd { .. } => "exec_end",
    EdgeMessage::Ping { .. } => "ping",
    EdgeMessage::Pong { .. } => "pong",
    EdgeMessage::Error { .. } => "error",
  }
}
