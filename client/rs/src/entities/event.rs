use serde::{Deserialize, Serialize};
use strum::Display;

/// A normalized container lifecycle event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerEvent {
  #[serde(default)]
  pub id: String,
  pub environment_id: String,
  pub container_id: String,
  #[serde(default)]
  pub container_name: Option<String>,
  #[serde(default)]
  pub image: Option<String>,
  pub action: String,
  #[serde(default)]
  pub actor_attributes: serde_json::Value,
  /// Unix ms.
  pub timestamp: i64,
  /// Daemon provided nanosecond timestamp, used for dedup.
  #[serde(default)]
  pub time_nano: i64,
}

impl ContainerEvent {
  /// In-memory dedup key, bounded to a short window by the collector.
  pub fn dedup_key(&self) -> String {
    format!(
      "{}:{}:{}:{}",
      self.environment_id, self.time_nano, self.container_id,
      self.action
    )
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventSeverity {
  #[default]
  Info,
  Success,
  Warning,
  Error,
}

/// Notification severity derived from the daemon action.
pub fn severity_for_action(action: &str) -> EventSeverity {
  match action {
    "die" | "kill" | "oom" => EventSeverity::Error,
    "stop" => EventSeverity::Warning,
    "start" => EventSeverity::Success,
    _ => EventSeverity::Info,
  }
}

/// Online / offline transition for one environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvStatus {
  pub environment_id: String,
  pub name: String,
  pub online: bool,
  #[serde(default)]
  pub error: Option<String>,
}

/// A host level metrics sample for one environment.
/// CPU is normalized to 0-100 across all host cores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostMetric {
  pub environment_id: String,
  pub cpu_percent: f64,
  pub memory_percent: f64,
  pub memory_used: u64,
  pub memory_total: u64,
  pub timestamp: i64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn severity_mapping() {
    assert_eq!(severity_for_action("die"), EventSeverity::Error);
    assert_eq!(severity_for_action("kill"), EventSeverity::Error);
    assert_eq!(severity_for_action("oom"), EventSeverity::Error);
    assert_eq!(severity_for_action("stop"), EventSeverity::Warning);
    assert_eq!(severity_for_action("start"), EventSeverity::Success);
    assert_eq!(severity_for_action("create"), EventSeverity::Info);
    assert_eq!(
      severity_for_action("health_status"),
      EventSeverity::Info
    );
  }
}
