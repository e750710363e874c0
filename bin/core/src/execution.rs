//! The execution journal: one row per schedule fire, appended to
//! while running, terminal once finalized. Also owns the retention
//! cleanups that keep the journal and the event table bounded.

use anyhow::Context;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use stevedore_client::entities::{
  schedule::{
    ExecutionStatus, ExecutionTrigger, ScheduleExecution,
    ScheduleKind,
  },
  stevedore_timestamp,
};
use uuid::Uuid;

use crate::{
  schedule::{
    SYSTEM_EVENT_CLEANUP, SYSTEM_SCHEDULE_CLEANUP,
    SYSTEM_VOLUME_CLEANUP,
  },
  state::store,
  store::settings,
};

const DEFAULT_SCHEDULE_RETENTION_DAYS: u64 = 30;
const DEFAULT_EVENT_RETENTION_DAYS: u64 = 14;
const ONE_DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// A running execution row. Dropping the handle without
/// [ExecutionHandle::finish] leaves the row in `running`, which the
/// next retention pass will age out; jobs are expected to finish
/// every path.
pub struct ExecutionHandle {
  pub id: String,
  triggered_at: i64,
}

pub async fn begin(
  kind: ScheduleKind,
  schedule_id: &str,
  environment_id: Option<&str>,
  entity_name: &str,
  trigger: ExecutionTrigger,
) -> anyhow::Result<ExecutionHandle> {
  let triggered_at = stevedore_timestamp();
  let id = Uuid::new_v4().to_string();
  store()
    .executions()
    .create(ScheduleExecution {
      id: id.clone(),
      schedule_kind: kind,
      schedule_id: schedule_id.to_string(),
      environment_id: environment_id.map(str::to_string),
      entity_name: entity_name.to_string(),
      trigger,
      triggered_at,
      started_at: None,
      completed_at: None,
      duration_ms: None,
      status: ExecutionStatus::Queued,
      error: None,
      details: Value::Null,
      logs: String::new(),
    })
    .await
    .context("Failed to create execution row")?;
  store()
    .executions()
    .set_started(&id, triggered_at)
    .await
    .context("Failed to mark execution started")?;
  Ok(ExecutionHandle { id, triggered_at })
}

impl ExecutionHandle {
  /// Append one log line, prefixed with an ISO timestamp.
  pub async fn log(&self, line: impl AsRef<str>) {
    let now = Utc
      .timestamp_millis_opt(stevedore_timestamp())
      .single()
      .unwrap_or_else(Utc::now);
    let line = format!(
      "[{}] {}\n",
      now.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
      line.as_ref()
    );
    if let Err(e) =
      store().executions().append_logs(&self.id, &line).await
    {
      warn!("failed to append execution log | {e:#}");
    }
  }

  pub async fn finish(
    self,
    status: ExecutionStatus,
    error: Option<String>,
    details: Value,
  ) {
    let completed_at = stevedore_timestamp();
    if let Err(e) = store()
      .executions()
      .finalize(
        &self.id,
        status,
        error,
        details,
        completed_at,
        completed_at - self.triggered_at,
      )
      .await
    {
      error!("failed to finalize execution {} | {e:#}", self.id);
    }
  }
}

/// Entry point for the system cleanup schedules.
pub async fn run_system_cleanup_job(
  job_id: &str,
  trigger: ExecutionTrigger,
) -> anyhow::Result<()> {
  let handle = begin(
    ScheduleKind::SystemCleanup,
    job_id,
    None,
    job_id,
    trigger,
  )
  .await?;
  let res = match job_id {
    SYSTEM_SCHEDULE_CLEANUP => cleanup_executions(&handle).await,
    SYSTEM_EVENT_CLEANUP => cleanup_events(&handle).await,
    SYSTEM_VOLUME_CLEANUP => {
      crate::update::cleanup_helper_containers(&handle).await
    }
    other => Err(anyhow::anyhow!("unknown system job {other}")),
  };
  match res {
    Ok(details) => {
      handle
        .finish(ExecutionStatus::Success, None, details)
        .await;
      Ok(())
    }
    Err(e) => {
      handle
        .finish(
          ExecutionStatus::Failed,
          Some(format!("{e:#}")),
          Value::Null,
        )
        .await;
      Err(e)
    }
  }
}

async fn cleanup_executions(
  handle: &ExecutionHandle,
) -> anyhow::Result<Value> {
  let days = settings::get_u64(
    settings::SCHEDULE_RETENTION_DAYS,
    DEFAULT_SCHEDULE_RETENTION_DAYS,
  )
  .await;
  let cutoff = stevedore_timestamp() - days as i64 * ONE_DAY_MS;
  let deleted = store()
    .executions()
    .delete_older_than(cutoff)
    .await
    .context("Failed to delete old executions")?;
  if deleted > 0 {
    info!("deleted {deleted} executions older than {days}d");
  }
  handle
    .log(format!("removed {deleted} executions older than {days}d"))
    .await;
  Ok(json!({ "deleted": deleted, "retention_days": days }))
}

async fn cleanup_events(
  handle: &ExecutionHandle,
) -> anyhow::Result<Value> {
  let days = settings::get_u64(
    settings::EVENT_RETENTION_DAYS,
    DEFAULT_EVENT_RETENTION_DAYS,
  )
  .await;
  let cutoff = stevedore_timestamp() - days as i64 * ONE_DAY_MS;
  let deleted = store()
    .container_events()
    .delete_older_than(cutoff)
    .await
    .context("Failed to delete old container events")?;
  if deleted > 0 {
    info!("deleted {deleted} container events older than {days}d");
  }
  handle
    .log(format!(
      "removed {deleted} container events older than {days}d"
    ))
    .await;
  Ok(json!({ "deleted": deleted, "retention_days": days }))
}
