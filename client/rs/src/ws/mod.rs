//! The wire protocol spoken between the core and edge agents.
//!
//! All frames are JSON text messages carrying a `type` discriminator.
//! Binary request / response bodies are base64 encoded strings flagged
//! with `isBinary`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

mod connect;

pub use connect::connect_agent;

/// Agents must heartbeat at least this often.
pub const PING_INTERVAL_SECS: u64 = 30;
/// The core closes connections silent for longer than this.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeMessage {
  /// First frame on every connection, agent to core.
  #[serde(rename_all = "camelCase")]
  Hello {
    version: String,
    agent_id: String,
    agent_name: String,
    token: String,
    #[serde(default)]
    docker_version: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
  },
  /// Core accepts the hello.
  #[serde(rename_all = "camelCase")]
  Welcome {
    environment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
  },
  /// A daemon API call forwarded to the agent.
  #[serde(rename_all = "camelCase")]
  Request {
    request_id: String,
    method: String,
    path: String,
    #[serde(default)]
    headers: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(default)]
    streaming: bool,
  },
  /// The agent's reply to a non streaming request.
  #[serde(rename_all = "camelCase")]
  Response {
    request_id: String,
    status_code: u16,
    #[serde(default)]
    headers: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(default)]
    is_binary: bool,
  },
  /// One chunk of a streaming response.
  #[serde(rename_all = "camelCase")]
  Stream {
    request_id: String,
    data: String,
    #[serde(default)]
    is_binary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream: Option<StdStream>,
  },
  /// Terminates a stream; also sent core to agent with
  /// `reason: cancelled` to cancel.
  #[serde(rename_all = "camelCase")]
  StreamEnd {
    request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
  },
  /// Periodic host metrics.
  #[serde(rename_all = "camelCase")]
  Metrics {
    timestamp: i64,
    metrics: AgentMetrics,
  },
  /// One daemon container event observed by the agent.
  #[serde(rename_all = "camelCase")]
  ContainerEvent { event: AgentContainerEvent },
  /// Open an interactive exec session in a container.
  #[serde(rename_all = "camelCase")]
  ExecStart {
    request_id: String,
    container_id: String,
    shell: String,
    #[serde(default)]
    tty: bool,
  },
  #[serde(rename_all = "camelCase")]
  ExecReady { request_id: String },
  #[serde(rename_all = "camelCase")]
  ExecInput { request_id: String, data: String },
  #[serde(rename_all = "camelCase")]
  ExecOutput {
    request_id: String,
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream: Option<StdStream>,
  },
  #[serde(rename_all = "camelCase")]
  ExecResize {
    request_id: String,
    cols: u16,
    rows: u16,
  },
  #[serde(rename_all = "camelCase")]
  ExecEnd {
    request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exit_code: Option<i64>,
  },
  #[serde(rename_all = "camelCase")]
  Ping { timestamp: i64 },
  #[serde(rename_all = "camelCase")]
  Pong { timestamp: i64 },
  /// Out of band error. With a request id, rejects that waiter.
  #[serde(rename_all = "camelCase")]
  Error {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
  },
}

impl EdgeMessage {
  pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
    serde_json::from_str(json)
  }

  pub fn to_json_string(&self) -> serde_json::Result<String> {
    serde_json::to_string(self)
  }
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
  Stdout,
  Stderr,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
  /// Sum of container cpu usage, un-normalized.
  pub cpu_usage: f64,
  pub cpu_cores: u64,
  pub memory_total: u64,
  pub memory_used: u64,
  pub memory_free: u64,
  #[serde(default)]
  pub disk_total: u64,
  #[serde(default)]
  pub disk_used: u64,
  #[serde(default)]
  pub disk_free: u64,
  #[serde(default)]
  pub network_rx_bytes: u64,
  #[serde(default)]
  pub network_tx_bytes: u64,
  #[serde(default)]
  pub uptime: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContainerEvent {
  pub container_id: String,
  #[serde(default)]
  pub container_name: Option<String>,
  #[serde(default)]
  pub image: Option<String>,
  pub action: String,
  #[serde(default)]
  pub actor_attributes: Value,
  pub timestamp: i64,
  #[serde(default)]
  pub time_nano: i64,
}

/// Why a connection (and all of its pending waiters) was closed.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CloseReason {
  Timeout,
  Replaced,
  EnvDeleted,
  ConnectionClosed,
  Cancelled,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hello_uses_camel_case_fields() {
    let msg = EdgeMessage::Hello {
      version: "1.2.0".into(),
      agent_id: "agent-1".into(),
      agent_name: "edge-host".into(),
      token: "tok".into(),
      docker_version: Some("27.0".into()),
      hostname: Some("edge".into()),
      capabilities: vec!["exec".into()],
    };
    let json: Value =
      serde_json::from_str(&msg.to_json_string().unwrap()).unwrap();
    assert_eq!(json["type"], "hello");
    assert_eq!(json["agentId"], "agent-1");
    assert_eq!(json["dockerVersion"], "27.0");
  }

  #[test]
  fn stream_end_tag_is_snake_case() {
    let msg = EdgeMessage::StreamEnd {
      request_id: "r1".into(),
      reason: Some(CloseReason::Cancelled.to_string()),
    };
    let json: Value =
      serde_json::from_str(&msg.to_json_string().unwrap()).unwrap();
    assert_eq!(json["type"], "stream_end");
    assert_eq!(json["requestId"], "r1");
    assert_eq!(json["reason"], "cancelled");
  }

  #[test]
  fn response_round_trips_binary_flag() {
    let raw = r#"{"type":"response","requestId":"abc","statusCode":200,"headers":{},"body":"aGk=","isBinary":true}"#;
    let msg = EdgeMessage::from_json_str(raw).unwrap();
    match msg {
      EdgeMessage::Response {
        request_id,
        status_code,
        body,
        is_binary,
        ..
      } => {
        assert_eq!(request_id, "abc");
        assert_eq!(status_code, 200);
        assert_eq!(body.as_deref(), Some("aGk="));
        assert!(is_binary);
      }
      other => panic!("wrong variant: {other:?}"),
    }
  }

  #[test]
  fn container_event_frame_parses() {
    let raw = r#"{"type":"container_event","event":{"containerId":"c1","action":"start","timestamp":1700000000000}}"#;
    let msg = EdgeMessage::from_json_str(raw).unwrap();
    match msg {
      EdgeMessage::ContainerEvent { event } => {
        assert_eq!(event.container_id, "c1");
        assert_eq!(event.action, "start");
        assert!(event.container_name.is_none());
      }
      other => panic!("wrong variant: {other:?}"),
    }
  }

  #[test]
  fn unknown_type_is_an_error() {
    assert!(
      EdgeMessage::from_json_str(r#"{"type":"bogus"}"#).is_err()
    );
  }
}
