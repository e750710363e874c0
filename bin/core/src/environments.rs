//! Environment lifecycle hooks, called by the api surface after it
//! writes through the store.

use stevedore_client::ws::CloseReason;

use crate::{gateway, router, schedule, state::store, workers};

/// Transport or collection flags changed: drop the cached handle,
/// restart collectors, re-register env schedules (fresh timezone).
pub async fn on_environment_updated(environment_id: &str) {
  router::clear_config_cache(environment_id);
  workers::refresh_environment(environment_id).await;
  schedule::refresh_schedules_for_environment(environment_id)
    .await;
}

/// The environment is gone: everything attached to it winds down.
/// The store handles row cascades; this clears the in-memory side.
pub async fn on_environment_deleted(environment_id: &str) {
  router::clear_config_cache(environment_id);
  workers::stop_environment(environment_id);
  gateway::close_connection(
    environment_id,
    CloseReason::EnvDeleted,
  );
  match store()
    .schedules()
    .list_for_environment(environment_id)
    .await
  {
    Ok(schedules) => {
      for schedule in schedules {
        schedule::unregister(schedule.kind, &schedule.id);
      }
    }
    Err(e) => {
      warn!(
        "failed to unregister schedules for deleted environment {environment_id} | {e:#}"
      );
    }
  }
}

/// A new environment starts collecting immediately.
pub async fn on_environment_created(environment_id: &str) {
  workers::refresh_environment(environment_id).await;
}
