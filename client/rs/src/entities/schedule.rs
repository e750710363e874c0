use serde::{Deserialize, Serialize};
use strum::Display;

/// A cron registered job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schedule {
  pub id: String,
  pub kind: ScheduleKind,
  /// The format of the schedule expression
  #[serde(default)]
  pub format: ScheduleFormat,
  pub cron_expression: String,
  pub enabled: bool,
  /// IANA timezone. Empty falls back to the process default.
  #[serde(default)]
  pub timezone: String,
  /// Target environment, when the kind is environment scoped.
  #[serde(default)]
  pub environment_id: Option<String>,
  /// Kind specific payload: container id for container updates,
  /// git stack id for syncs, mode flags for env checks.
  #[serde(default)]
  pub payload: serde_json::Value,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScheduleKind {
  #[default]
  ContainerUpdate,
  GitStackSync,
  EnvUpdateCheck,
  SystemCleanup,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFormat {
  #[default]
  Cron,
  English,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionTrigger {
  #[default]
  Cron,
  Webhook,
  Manual,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
  #[default]
  Queued,
  Running,
  Success,
  Failed,
  Skipped,
}

impl ExecutionStatus {
  pub fn terminal(&self) -> bool {
    matches!(
      self,
      ExecutionStatus::Success
        | ExecutionStatus::Failed
        | ExecutionStatus::Skipped
    )
  }
}

/// One invocation of a schedule. Append-only while running,
/// terminal once `completed_at` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleExecution {
  pub id: String,
  pub schedule_kind: ScheduleKind,
  pub schedule_id: String,
  #[serde(default)]
  pub environment_id: Option<String>,
  /// Container / stack / environment name the run acted on.
  pub entity_name: String,
  pub trigger: ExecutionTrigger,
  pub triggered_at: i64,
  #[serde(default)]
  pub started_at: Option<i64>,
  #[serde(default)]
  pub completed_at: Option<i64>,
  #[serde(default)]
  pub duration_ms: Option<i64>,
  pub status: ExecutionStatus,
  #[serde(default)]
  pub error: Option<String>,
  /// Job specific structured results.
  #[serde(default)]
  pub details: serde_json::Value,
  /// Timestamp prefixed log lines, appended during the run.
  #[serde(default)]
  pub logs: String,
}
