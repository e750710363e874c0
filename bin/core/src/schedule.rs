//! Cron registry and executor. One registered entry per `(kind,
//! id)`; a one second executor loop fires due jobs on their own
//! tasks, and a five minute refresh loop rebuilds the registry from
//! the store so drift and external edits heal themselves.

use std::{
  collections::HashMap,
  sync::{OnceLock, RwLock},
};

use anyhow::{Context, anyhow};
use chrono::Local;
use stevedore_client::entities::schedule::{
  ExecutionTrigger, Schedule, ScheduleFormat, ScheduleKind,
};

use crate::{
  state::store,
  store::settings,
};

/// Synthetic ids for the system cleanup jobs, which live in settings
/// rather than the schedule repository.
pub const SYSTEM_SCHEDULE_CLEANUP: &str = "system_schedule_cleanup";
pub const SYSTEM_EVENT_CLEANUP: &str = "system_event_cleanup";
pub const SYSTEM_VOLUME_CLEANUP: &str = "system_volume_cleanup";

const DEFAULT_SCHEDULE_CLEANUP_CRON: &str = "0 2 * * *";
const DEFAULT_EVENT_CLEANUP_CRON: &str = "30 2 * * *";
/// Leaked volume helper containers are cheap to look for.
const VOLUME_CLEANUP_CRON: &str = "15 * * * *";

type JobKey = (ScheduleKind, String);

struct RegisteredJob {
  schedule: Schedule,
  /// Resolved at registration so the executor never blocks on the
  /// settings repo.
  timezone: String,
  next_run: Result<i64, String>,
}

type Jobs = HashMap<JobKey, RegisteredJob>;

fn jobs() -> &'static RwLock<Jobs> {
  static JOBS: OnceLock<RwLock<Jobs>> = OnceLock::new();
  JOBS.get_or_init(Default::default)
}

pub fn spawn_schedule_executor() {
  // Executor loop.
  tokio::spawn(async move {
    loop {
      let now = async_timing_util::wait_until_timelength(
        async_timing_util::Timelength::OneSecond,
        0,
      )
      .await as i64;
      let due = {
        let mut lock = jobs().write().unwrap();
        let mut due = Vec::new();
        for (key, job) in lock.iter_mut() {
          let Ok(next_run) = &job.next_run else {
            continue;
          };
          if *next_run > now {
            continue;
          }
          due.push((key.clone(), job.schedule.clone()));
          job.next_run =
            next_occurrence_in_tz(
              &job.schedule.cron_expression,
              job.schedule.format,
              &job.timezone,
            )
            .map_err(|e| format!("{e:#}"));
        }
        due
      };
      for ((kind, id), schedule) in due {
        tokio::spawn(async move {
          run_job(kind, id, schedule, ExecutionTrigger::Cron).await;
        });
      }
    }
  });
  // Refresh loop.
  tokio::spawn(async move {
    refresh_all_schedules().await;
    loop {
      async_timing_util::wait_until_timelength(
        async_timing_util::Timelength::FiveMinutes,
        500,
      )
      .await;
      refresh_all_schedules().await;
    }
  });
}

/// Register (or re-register) one schedule. Idempotent: any existing
/// entry for `(kind, id)` is replaced. Disabled or unparsable
/// schedules end up unregistered (the parse error is retained for
/// inspection).
pub async fn register(schedule: Schedule) {
  let key = (schedule.kind, schedule.id.clone());
  let mut lock = jobs().write().unwrap();
  lock.remove(&key);
  if !schedule.enabled || schedule.cron_expression.is_empty() {
    return;
  }
  let timezone = resolve_timezone_blocking(&schedule.timezone);
  let next_run = next_occurrence_in_tz(
    &schedule.cron_expression,
    schedule.format,
    &timezone,
  )
  .map_err(|e| format!("{e:#}"));
  lock.insert(
    key,
    RegisteredJob {
      schedule,
      timezone,
      next_run,
    },
  );
}

/// Idempotent; unregistering an unknown job is a no-op.
pub fn unregister(kind: ScheduleKind, id: &str) {
  jobs().write().unwrap().remove(&(kind, id.to_string()));
}

pub fn next_scheduled_run(
  kind: ScheduleKind,
  id: &str,
) -> (Option<i64>, Option<String>) {
  match jobs()
    .read()
    .unwrap()
    .get(&(kind, id.to_string()))
    .map(|job| &job.next_run)
  {
    Some(Ok(next)) => (Some(*next), None),
    Some(Err(e)) => (None, Some(e.clone())),
    None => (None, None),
  }
}

/// Rebuild the whole dynamic set from the store, plus the system
/// cleanup jobs from settings. Called at startup, on environment
/// change, and periodically.
pub async fn refresh_all_schedules() {
  let default_timezone =
    settings::get_string(settings::DEFAULT_TIMEZONE, "").await;
  set_default_timezone(default_timezone);

  let schedules = match store().schedules().list().await {
    Ok(schedules) => schedules,
    Err(e) => {
      error!("failed to list schedules for refresh | {e:#}");
      return;
    }
  };
  // Drop registry entries whose schedule is gone.
  {
    let mut lock = jobs().write().unwrap();
    lock.retain(|(kind, id), _| {
      matches!(kind, ScheduleKind::SystemCleanup)
        || schedules.iter().any(|s| &s.kind == kind && &s.id == id)
    });
  }
  for schedule in schedules {
    register(schedule).await;
  }
  register_system_jobs().await;
}

/// Re-register every schedule targeting one environment, picking up
/// timezone or config changes.
pub async fn refresh_schedules_for_environment(
  environment_id: &str,
) {
  let schedules = match store()
    .schedules()
    .list_for_environment(environment_id)
    .await
  {
    Ok(schedules) => schedules,
    Err(e) => {
      error!(
        "failed to list schedules for environment {environment_id} | {e:#}"
      );
      return;
    }
  };
  for schedule in schedules {
    register(schedule).await;
  }
}

async fn register_system_jobs() {
  let entries = [
    (
      SYSTEM_SCHEDULE_CLEANUP,
      settings::get_string(
        settings::SCHEDULE_CLEANUP_CRON,
        DEFAULT_SCHEDULE_CLEANUP_CRON,
      )
      .await,
      settings::get_bool(settings::SCHEDULE_CLEANUP_ENABLED, true)
        .await,
    ),
    (
      SYSTEM_EVENT_CLEANUP,
      settings::get_string(
        settings::EVENT_CLEANUP_CRON,
        DEFAULT_EVENT_CLEANUP_CRON,
      )
      .await,
      settings::get_bool(settings::EVENT_CLEANUP_ENABLED, true)
        .await,
    ),
    (
      SYSTEM_VOLUME_CLEANUP,
      String::from(VOLUME_CLEANUP_CRON),
      settings::get_bool(settings::VOLUME_CLEANUP_ENABLED, true)
        .await,
    ),
  ];
  for (id, cron_expression, enabled) in entries {
    register(Schedule {
      id: id.to_string(),
      kind: ScheduleKind::SystemCleanup,
      format: ScheduleFormat::Cron,
      cron_expression,
      enabled,
      timezone: String::new(),
      environment_id: None,
      payload: serde_json::Value::Null,
    })
    .await;
  }
}

/// Fire a schedule outside its cron, eg from the api.
pub async fn trigger_now(
  kind: ScheduleKind,
  id: &str,
) -> anyhow::Result<()> {
  let schedule = match kind {
    ScheduleKind::SystemCleanup => jobs()
      .read()
      .unwrap()
      .get(&(kind, id.to_string()))
      .map(|job| job.schedule.clone())
      .with_context(|| {
        format!("no system job registered with id {id}")
      })?,
    _ => store()
      .schedules()
      .get(id)
      .await
      .context("Failed to query schedule")?
      .with_context(|| format!("no schedule with id {id}"))?,
  };
  let id = id.to_string();
  tokio::spawn(async move {
    run_job(kind, id, schedule, ExecutionTrigger::Manual).await;
  });
  Ok(())
}

/// Dispatch one fire. Re-reads the schedule defensively: it may have
/// been disabled or deleted between registration and fire.
async fn run_job(
  kind: ScheduleKind,
  id: String,
  registered: Schedule,
  trigger: ExecutionTrigger,
) {
  let schedule = match kind {
    ScheduleKind::SystemCleanup => registered,
    _ => {
      match store().schedules().get(&id).await {
        Ok(Some(latest)) if latest.enabled => latest,
        Ok(_) => {
          debug!(
            "schedule {id} disabled or removed since registration, skipping fire"
          );
          return;
        }
        Err(e) => {
          error!("failed to re-read schedule {id} | {e:#}");
          return;
        }
      }
    }
  };
  let res = match kind {
    ScheduleKind::ContainerUpdate => {
      crate::update::run_container_update_job(&schedule, trigger)
        .await
    }
    ScheduleKind::EnvUpdateCheck => {
      crate::update::run_env_update_check_job(&schedule, trigger)
        .await
    }
    ScheduleKind::GitStackSync => {
      crate::stack::run_git_sync_job(&schedule, trigger).await
    }
    ScheduleKind::SystemCleanup => {
      crate::execution::run_system_cleanup_job(
        &schedule.id,
        trigger,
      )
      .await
    }
  };
  if let Err(e) = res {
    warn!("scheduled {kind} job {id} failed | {e:#}");
  }
}

// ---------------------------------------------------------------
// cron evaluation

/// Process wide default timezone, refreshed with the registry.
fn default_timezone() -> &'static RwLock<String> {
  static DEFAULT_TZ: OnceLock<RwLock<String>> = OnceLock::new();
  DEFAULT_TZ.get_or_init(Default::default)
}

fn set_default_timezone(timezone: String) {
  *default_timezone().write().unwrap() = timezone;
}

fn resolve_timezone_blocking(schedule_timezone: &str) -> String {
  if !schedule_timezone.is_empty() {
    return schedule_timezone.to_string();
  }
  default_timezone().read().unwrap().clone()
}

fn parse_cron(
  expression: &str,
  format: ScheduleFormat,
) -> anyhow::Result<croner::Cron> {
  let expression = match format {
    ScheduleFormat::Cron => expression.to_string(),
    ScheduleFormat::English => {
      english_to_cron::str_cron_syntax(expression)
        .map_err(|e| {
          anyhow!("failed to parse english schedule | {e:?}")
        })?
        .split(' ')
        // croner does not accept the year field.
        .take(6)
        .collect::<Vec<_>>()
        .join(" ")
    }
  };
  croner::parser::CronParser::builder()
    .seconds(croner::parser::Seconds::Optional)
    .dom_and_dow(true)
    .build()
    .parse(&expression)
    .with_context(|| {
      format!("failed to parse cron expression: {expression}")
    })
}

/// Next run in unix ms for an expression in the given timezone
/// (empty = server local time).
pub fn next_occurrence_in_tz(
  expression: &str,
  format: ScheduleFormat,
  timezone: &str,
) -> anyhow::Result<i64> {
  let cron = parse_cron(expression, format)?;
  let next = if timezone.is_empty() {
    let now = chrono::Local::now().with_timezone(&Local);
    cron
      .find_next_occurrence(&now, false)
      .context("failed to find next run time")?
      .timestamp_millis()
  } else {
    let tz: chrono_tz::Tz = timezone
      .parse()
      .map_err(|_| anyhow!("unknown timezone: {timezone}"))?;
    let now = chrono::Local::now().with_timezone(&tz);
    cron
      .find_next_occurrence(&now, false)
      .context("failed to find next run time")?
      .timestamp_millis()
  };
  Ok(next)
}

/// Next run for api consumers, resolving the default timezone.
pub fn next_run(
  expression: &str,
  format: ScheduleFormat,
  timezone: &str,
) -> anyhow::Result<i64> {
  let timezone = resolve_timezone_blocking(timezone);
  next_occurrence_in_tz(expression, format, &timezone)
}

pub fn is_valid_cron(expression: &str) -> bool {
  parse_cron(expression, ScheduleFormat::Cron).is_ok()
}

#[cfg(test)]
mod tests {
  use super::*;
  use stevedore_client::entities::schedule::ScheduleFormat;

  #[test]
  fn five_and_six_field_crons_parse() {
    assert!(is_valid_cron("0 2 * * *"));
    assert!(is_valid_cron("30 0 2 * * *"));
    assert!(is_valid_cron("*/5 * * * *"));
    assert!(!is_valid_cron("not a cron"));
    assert!(!is_valid_cron("99 99 * * *"));
  }

  #[test]
  fn next_occurrence_is_in_the_future() {
    let next = next_occurrence_in_tz(
      "*/5 * * * *",
      ScheduleFormat::Cron,
      "",
    )
    .unwrap();
    assert!(
      next
        > stevedore_client::entities::stevedore_timestamp()
          - 1000
    );
  }

  #[test]
  fn timezone_changes_the_next_occurrence() {
    // Same wall clock expression in two zones 12h apart lands on
    // different instants.
    let tokyo = next_occurrence_in_tz(
      "0 9 * * *",
      ScheduleFormat::Cron,
      "Asia/Tokyo",
    )
    .unwrap();
    let la = next_occurrence_in_tz(
      "0 9 * * *",
      ScheduleFormat::Cron,
      "America/Los_Angeles",
    )
    .unwrap();
    assert_ne!(tokyo, la);
  }

  #[test]
  fn unknown_timezone_is_an_error() {
    assert!(
      next_occurrence_in_tz(
        "0 9 * * *",
        ScheduleFormat::Cron,
        "Mars/Olympus_Mons"
      )
      .is_err()
    );
  }

  #[test]
  fn english_expressions_are_supported() {
    let next = next_occurrence_in_tz(
      "every 15 minutes",
      ScheduleFormat::English,
      "",
    );
    assert!(next.is_ok());
  }

  #[tokio::test]
  async fn register_is_idempotent_and_unregister_is_a_noop_when_absent()
  {
    let schedule = Schedule {
      id: String::from("test-sched"),
      kind: ScheduleKind::ContainerUpdate,
      format: ScheduleFormat::Cron,
      cron_expression: String::from("0 4 * * *"),
      enabled: true,
      timezone: String::new(),
      environment_id: None,
      payload: serde_json::Value::Null,
    };
    register(schedule.clone()).await;
    let (first, _) = next_scheduled_run(
      ScheduleKind::ContainerUpdate,
      "test-sched",
    );
    register(schedule.clone()).await;
    let (second, _) = next_scheduled_run(
      ScheduleKind::ContainerUpdate,
      "test-sched",
    );
    assert_eq!(first, second);
    assert!(first.is_some());

    unregister(ScheduleKind::ContainerUpdate, "test-sched");
    assert_eq!(
      next_scheduled_run(
        ScheduleKind::ContainerUpdate,
        "test-sched"
      ),
      (None, None)
    );
    // Unregistering again is fine.
    unregister(ScheduleKind::ContainerUpdate, "test-sched");
  }

  #[tokio::test]
  async fn disabled_schedules_are_not_registered() {
    let schedule = Schedule {
      id: String::from("disabled-sched"),
      kind: ScheduleKind::EnvUpdateCheck,
      format: ScheduleFormat::Cron,
      cron_expression: String::from("0 4 * * *"),
      enabled: false,
      timezone: String::new(),
      environment_id: None,
      payload: serde_json::Value::Null,
    };
    register(schedule).await;
    assert_eq!(
      next_scheduled_run(
        ScheduleKind::EnvUpdateCheck,
        "disabled-sched"
      ),
      (None, None)
    );
  }

  #[tokio::test]
  async fn invalid_cron_retains_the_error() {
    let schedule = Schedule {
      id: String::from("broken-sched"),
      kind: ScheduleKind::GitStackSync,
      format: ScheduleFormat::Cron,
      cron_expression: String::from("not a cron"),
      enabled: true,
      timezone: String::new(),
      environment_id: None,
      payload: serde_json::Value::Null,
    };
    register(schedule).await;
    let (next, error) = next_scheduled_run(
      ScheduleKind::GitStackSync,
      "broken-sched",
    );
    assert_eq!(next, None);
    assert!(error.is_some());
    unregister(ScheduleKind::GitStackSync, "broken-sched");
  }
}
