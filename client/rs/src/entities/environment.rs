use serde::{Deserialize, Serialize};
use strum::Display;

use super::scan::{ScanCriteria, ScannerKind};

/// One container daemon managed by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
  pub id: String,
  /// Unique display name.
  pub name: String,
  pub transport: EnvironmentTransport,
  /// Whether the event collector runs for this environment.
  #[serde(default = "default_collect")]
  pub collect_activity: bool,
  /// Whether the metrics collector runs for this environment.
  #[serde(default = "default_collect")]
  pub collect_metrics: bool,
  #[serde(default)]
  pub icon: String,
  #[serde(default)]
  pub labels: Vec<String>,
  /// Scanner(s) consulted before approving auto updates.
  #[serde(default)]
  pub scanner: ScannerKind,
  #[serde(default)]
  pub scan_criteria: ScanCriteria,
  /// Disk usage percent that triggers a warning. Default 80.
  #[serde(default)]
  pub disk_warning_threshold: Option<f64>,
  /// Observed agent identity, edge transport only.
  #[serde(default)]
  pub agent: Option<AgentInfo>,
  pub created_at: i64,
  pub updated_at: i64,
}

fn default_collect() -> bool {
  true
}

impl Environment {
  pub fn is_edge(&self) -> bool {
    matches!(self.transport, EnvironmentTransport::AgentEdge)
  }
}

/// How the core reaches the environment's daemon.
#[derive(
  Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display,
)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EnvironmentTransport {
  /// Local unix domain socket. When no path is given,
  /// well known candidate paths are probed in order.
  Socket {
    #[serde(default)]
    socket_path: Option<String>,
  },
  /// Direct HTTP / HTTPS to an exposed daemon port.
  Direct {
    host: String,
    port: u16,
    #[serde(default)]
    tls: Option<TlsConfig>,
  },
  /// HTTP / HTTPS to an agent proxying the daemon,
  /// authenticated with `X-Agent-Token`.
  AgentHttp {
    host: String,
    port: u16,
    #[serde(default)]
    tls: Option<TlsConfig>,
    agent_token: String,
  },
  /// The agent dials in over WebSocket; the core never connects out.
  AgentEdge,
}

impl Default for EnvironmentTransport {
  fn default() -> Self {
    EnvironmentTransport::Socket { socket_path: None }
  }
}

#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct TlsConfig {
  #[serde(default)]
  pub ca: Option<String>,
  #[serde(default)]
  pub cert: Option<String>,
  #[serde(default)]
  pub key: Option<String>,
  #[serde(default)]
  pub skip_verify: bool,
}

/// Identity reported by an edge agent in its hello frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
  pub agent_id: String,
  pub agent_name: String,
  pub agent_version: String,
  #[serde(default)]
  pub capabilities: Vec<String>,
  /// Last successful heartbeat / frame, unix ms.
  pub last_seen: i64,
}

/// A reverse-tunnel bearer token for one environment.
/// The secret is stored hashed; only the first eight characters
/// are kept in the clear for identification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentToken {
  pub id: String,
  pub environment_id: String,
  pub token_hash: String,
  pub prefix: String,
  pub active: bool,
  #[serde(default)]
  pub expires_at: Option<i64>,
  #[serde(default)]
  pub last_used: Option<i64>,
  pub created_at: i64,
}

impl AgentToken {
  pub fn expired(&self, now: i64) -> bool {
    self.expires_at.map(|at| at <= now).unwrap_or(false)
  }
}
