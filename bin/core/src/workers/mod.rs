//! Supervision of the per-environment collector tasks. Workers that
//! die get restarted with exponential backoff up to a cap; workers
//! for removed or reconfigured environments are cancelled and
//! respawned with fresh config.

use std::{
  sync::OnceLock,
  time::Duration,
};

use dashmap::DashMap;
use stevedore_client::entities::environment::Environment;
use tokio_util::sync::CancellationToken;

use crate::state::store;

pub mod events;
pub mod metrics;

const RESTART_BASE: Duration = Duration::from_secs(5);
const MAX_RESTARTS: u32 = 10;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
enum WorkerKind {
  Events,
  Metrics,
}

struct WorkerHandle {
  cancel: CancellationToken,
}

fn workers() -> &'static DashMap<(String, WorkerKind), WorkerHandle>
{
  static WORKERS: OnceLock<
    DashMap<(String, WorkerKind), WorkerHandle>,
  > = OnceLock::new();
  WORKERS.get_or_init(Default::default)
}

/// Spawn collectors for every environment. Called at startup.
pub async fn start_all() {
  let environments = match store().environments().list().await {
    Ok(environments) => environments,
    Err(e) => {
      error!("failed to list environments for workers | {e:#}");
      return;
    }
  };
  for environment in environments {
    start_environment(environment);
  }
}

/// (Re)start the collectors for one environment according to its
/// flags. Edge environments push their observations through the
/// agent connection instead.
pub fn start_environment(environment: Environment) {
  stop_environment(&environment.id);
  if environment.is_edge() {
    return;
  }
  if environment.collect_activity {
    spawn_supervised(
      environment.clone(),
      WorkerKind::Events,
    );
  }
  if environment.collect_metrics {
    spawn_supervised(environment, WorkerKind::Metrics);
  }
}

/// Cancel the collectors for one environment. Idempotent.
pub fn stop_environment(environment_id: &str) {
  for kind in [WorkerKind::Events, WorkerKind::Metrics] {
    if let Some((_, handle)) = workers()
      .remove(&(environment_id.to_string(), kind))
    {
      handle.cancel.cancel();
    }
  }
}

/// Re-read the environment and restart its collectors. Called on
/// environment update (transport change, collect flags).
pub async fn refresh_environment(environment_id: &str) {
  crate::router::clear_config_cache(environment_id);
  match store().environments().get(environment_id).await {
    Ok(Some(environment)) => start_environment(environment),
    Ok(None) => stop_environment(environment_id),
    Err(e) => {
      error!(
        "failed to refresh workers for {environment_id} | {e:#}"
      );
    }
  }
}

pub fn stop_all() {
  for entry in workers().iter() {
    entry.value().cancel.cancel();
  }
  workers().clear();
}

fn spawn_supervised(
  environment: Environment,
  kind: WorkerKind,
) {
  let cancel = CancellationToken::new();
  workers().insert(
    (environment.id.clone(), kind),
    WorkerHandle {
      cancel: cancel.clone(),
    },
  );
  tokio::spawn(async move {
    let mut restarts = 0u32;
    loop {
      let run = match kind {
        WorkerKind::Events => tokio::spawn(
          events::run_event_worker(
            environment.clone(),
            cancel.clone(),
          ),
        ),
        WorkerKind::Metrics => tokio::spawn(
          metrics::run_metrics_worker(
            environment.clone(),
            cancel.clone(),
          ),
        ),
      };
      match run.await {
        Ok(()) if cancel.is_cancelled() => return,
        Ok(()) => {
          // Worker loops only return on cancellation; reaching
          // here without it means the loop bailed out.
        }
        Err(e) => {
          error!(
            "{kind} worker for {} panicked | {e}",
            environment.name
          );
        }
      }
      if cancel.is_cancelled() {
        return;
      }
      restarts += 1;
      if restarts > MAX_RESTARTS {
        error!(
          "{kind} worker for {} exceeded {MAX_RESTARTS} restarts, giving up",
          environment.name
        );
        return;
      }
      let backoff = RESTART_BASE * 2u32.saturating_pow(restarts - 1);
      warn!(
        "restarting {kind} worker for {} in {}s (attempt {restarts})",
        environment.name,
        backoff.as_secs()
      );
      tokio::select! {
        _ = tokio::time::sleep(backoff) => {}
        _ = cancel.cancelled() => return,
      }
    }
  });
}
