//! The persistence seam. The core only ever talks to these typed
//! repositories; the embedding application wires in the actual
//! database behind them at [crate::state::init_services].

use async_trait::async_trait;
use stevedore_client::entities::{
  environment::{AgentInfo, AgentToken, Environment},
  event::{ContainerEvent, HostMetric},
  git::{GitCredential, GitStack},
  scan::VulnerabilityScan,
  schedule::{ExecutionStatus, Schedule, ScheduleExecution},
  stack::{StackEnvVar, StackSourceRecord},
  update::PendingContainerUpdate,
};

pub trait Store: Send + Sync + 'static {
  fn environments(&self) -> &dyn EnvironmentRepo;
  fn agent_tokens(&self) -> &dyn AgentTokenRepo;
  fn stack_sources(&self) -> &dyn StackSourceRepo;
  fn stack_env_vars(&self) -> &dyn StackEnvVarRepo;
  fn schedules(&self) -> &dyn ScheduleRepo;
  fn executions(&self) -> &dyn ExecutionRepo;
  fn container_events(&self) -> &dyn ContainerEventRepo;
  fn host_metrics(&self) -> &dyn HostMetricRepo;
  fn scans(&self) -> &dyn ScanRepo;
  fn pending_updates(&self) -> &dyn PendingUpdateRepo;
  fn git_stacks(&self) -> &dyn GitStackRepo;
  fn settings(&self) -> &dyn SettingsRepo;
}

#[async_trait]
pub trait EnvironmentRepo: Send + Sync {
  async fn list(&self) -> anyhow::Result<Vec<Environment>>;
  async fn get(&self, id: &str)
  -> anyhow::Result<Option<Environment>>;
  async fn update_agent_info(
    &self,
    id: &str,
    info: AgentInfo,
  ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AgentTokenRepo: Send + Sync {
  async fn list_active(&self) -> anyhow::Result<Vec<AgentToken>>;
  async fn create(&self, token: AgentToken) -> anyhow::Result<()>;
  async fn set_last_used(
    &self,
    id: &str,
    ts: i64,
  ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait StackSourceRepo: Send + Sync {
  async fn get(
    &self,
    environment_id: &str,
    stack_name: &str,
  ) -> anyhow::Result<Option<StackSourceRecord>>;
  async fn upsert(
    &self,
    record: StackSourceRecord,
  ) -> anyhow::Result<()>;
  async fn remove(
    &self,
    environment_id: &str,
    stack_name: &str,
  ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait StackEnvVarRepo: Send + Sync {
  async fn list(
    &self,
    environment_id: &str,
    stack_name: &str,
  ) -> anyhow::Result<Vec<StackEnvVar>>;
  async fn remove_for_stack(
    &self,
    environment_id: &str,
    stack_name: &str,
  ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ScheduleRepo: Send + Sync {
  async fn list(&self) -> anyhow::Result<Vec<Schedule>>;
  async fn get(&self, id: &str) -> anyhow::Result<Option<Schedule>>;
  async fn list_for_environment(
    &self,
    environment_id: &str,
  ) -> anyhow::Result<Vec<Schedule>>;
}

#[async_trait]
pub trait ExecutionRepo: Send + Sync {
  async fn create(
    &self,
    execution: ScheduleExecution,
  ) -> anyhow::Result<()>;
  async fn set_started(
    &self,
    id: &str,
    started_at: i64,
  ) -> anyhow::Result<()>;
  async fn append_logs(
    &self,
    id: &str,
    lines: &str,
  ) -> anyhow::Result<()>;
  async fn finalize(
    &self,
    id: &str,
    status: ExecutionStatus,
    error: Option<String>,
    details: serde_json::Value,
    completed_at: i64,
    duration_ms: i64,
  ) -> anyhow::Result<()>;
  async fn delete_older_than(&self, ts: i64)
  -> anyhow::Result<u64>;
}

#[async_trait]
pub trait ContainerEventRepo: Send + Sync {
  async fn insert(&self, event: ContainerEvent)
  -> anyhow::Result<()>;
  async fn delete_older_than(&self, ts: i64)
  -> anyhow::Result<u64>;
}

#[async_trait]
pub trait HostMetricRepo: Send + Sync {
  async fn insert(&self, metric: HostMetric) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ScanRepo: Send + Sync {
  async fn insert(
    &self,
    scan: VulnerabilityScan,
  ) -> anyhow::Result<()>;
  /// Cache lookup for the latest scan of an image in an environment.
  async fn latest_for_image(
    &self,
    environment_id: &str,
    image_id: &str,
  ) -> anyhow::Result<Option<VulnerabilityScan>>;
}

#[async_trait]
pub trait PendingUpdateRepo: Send + Sync {
  async fn upsert(
    &self,
    update: PendingContainerUpdate,
  ) -> anyhow::Result<()>;
  async fn remove(
    &self,
    environment_id: &str,
    container_id: &str,
  ) -> anyhow::Result<()>;
  async fn list_for_environment(
    &self,
    environment_id: &str,
  ) -> anyhow::Result<Vec<PendingContainerUpdate>>;
  /// Drop every row for the environment whose container id is not in
  /// `keep`. Leaves the pending set equal to the latest check result.
  async fn retain(
    &self,
    environment_id: &str,
    keep: &[String],
  ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait GitStackRepo: Send + Sync {
  async fn get(&self, id: &str)
  -> anyhow::Result<Option<GitStack>>;
  async fn get_credential(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<GitCredential>>;
}

#[async_trait]
pub trait SettingsRepo: Send + Sync {
  async fn get(&self, key: &str)
  -> anyhow::Result<Option<String>>;
}

/// Mutable operational settings with their defaults. Read on use, so
/// operators can change them without a restart.
pub mod settings {
  use crate::state::store;

  pub const SCHEDULE_RETENTION_DAYS: &str = "schedule_retention_days";
  pub const EVENT_RETENTION_DAYS: &str = "event_retention_days";
  pub const SCHEDULE_CLEANUP_CRON: &str = "schedule_cleanup_cron";
  pub const EVENT_CLEANUP_CRON: &str = "event_cleanup_cron";
  pub const SCHEDULE_CLEANUP_ENABLED: &str =
    "schedule_cleanup_enabled";
  pub const EVENT_CLEANUP_ENABLED: &str = "event_cleanup_enabled";
  pub const VOLUME_CLEANUP_ENABLED: &str = "volume_cleanup_enabled";
  pub const DEFAULT_TIMEZONE: &str = "default_timezone";
  pub const DEFAULT_GRYPE_ARGS: &str = "default_grype_args";
  pub const DEFAULT_TRIVY_ARGS: &str = "default_trivy_args";
  pub const SCAN_REQUIRE_ALL: &str = "scan_require_all";

  pub async fn get_string(key: &str, default: &str) -> String {
    match store().settings().get(key).await {
      Ok(Some(value)) if !value.is_empty() => value,
      Ok(_) => default.to_string(),
      Err(e) => {
        warn!("failed to read setting {key} | {e:#}");
        default.to_string()
      }
    }
  }

  pub async fn get_u64(key: &str, default: u64) -> u64 {
    let raw = get_string(key, &default.to_string()).await;
    raw.parse().unwrap_or_else(|_| {
      warn!("setting {key} is not an integer: {raw}");
      default
    })
  }

  pub async fn get_bool(key: &str, default: bool) -> bool {
    let raw = get_string(key, &default.to_string()).await;
    raw.parse().unwrap_or_else(|_| {
      warn!("setting {key} is not a bool: {raw}");
      default
    })
  }
}
