//! Per-environment container event collection. One long lived task
//! per environment with activity collection enabled and a transport
//! the core can dial; edge environments deliver their events as
//! agent frames into the same [process_event] pipeline.

use std::{collections::HashMap, time::Duration};

use futures::StreamExt;
use serde_json::{Value, json};
use stevedore_client::entities::{
  environment::Environment,
  event::{ContainerEvent, EnvStatus, severity_for_action},
  stevedore_timestamp,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
  notify::{NotificationKind, notify_best_effort},
  router,
  state::{broker, store},
};

/// Daemon actions worth recording. Everything else (exec_*, attach,
/// copy, ...) is noise at this layer.
const ALLOWED_ACTIONS: &[&str] = &[
  "create",
  "start",
  "stop",
  "die",
  "kill",
  "restart",
  "pause",
  "unpause",
  "destroy",
  "rename",
  "update",
  "oom",
  "health_status",
];

/// Containers the control plane itself runs on the daemon.
const SCANNER_IMAGE_PATTERNS: &[&str] =
  &["anchore/grype", "aquasec/trivy"];
const HELPER_NAME_PREFIXES: &[&str] = &["stevedore-helper-"];

const RECONNECT_MIN: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

const DEDUP_WINDOW_MS: i64 = 5_000;
const DEDUP_MAX_ENTRIES: usize = 200;
const DEDUP_PRUNE_INTERVAL_MS: i64 = 30_000;

/// Bounded window of recently seen `(env, time_nano, container,
/// action)` keys.
#[derive(Default)]
pub struct DedupCache {
  entries: HashMap<String, i64>,
  last_prune: i64,
}

impl DedupCache {
  /// Returns true when the key has not been seen inside the window.
  pub fn insert(&mut self, key: String, now: i64) -> bool {
    if self.entries.len() > DEDUP_MAX_ENTRIES
      || now - self.last_prune > DEDUP_PRUNE_INTERVAL_MS
    {
      self
        .entries
        .retain(|_, inserted| now - *inserted < DEDUP_WINDOW_MS);
      self.last_prune = now;
    }
    match self.entries.get(&key) {
      Some(inserted) if now - inserted < DEDUP_WINDOW_MS => false,
      _ => {
        self.entries.insert(key, now);
        true
      }
    }
  }
}

/// A raw daemon event, from either the stream or an agent frame.
pub struct IncomingEvent {
  pub container_id: String,
  pub container_name: Option<String>,
  pub image: Option<String>,
  pub action: String,
  pub actor_attributes: Value,
  pub timestamp: i64,
  pub time_nano: i64,
}

fn action_allowed(action: &str) -> bool {
  ALLOWED_ACTIONS.contains(&action)
    // Health events arrive as "health_status: healthy".
    || action.starts_with("health_status")
}

fn is_filtered_container(
  image: Option<&str>,
  name: Option<&str>,
) -> bool {
  if let Some(image) = image
    && SCANNER_IMAGE_PATTERNS.iter().any(|p| image.contains(p))
  {
    return true;
  }
  if let Some(name) = name
    && HELPER_NAME_PREFIXES.iter().any(|p| name.starts_with(p))
  {
    return true;
  }
  false
}

/// Persist + broadcast + notify one event, after filtering and
/// dedup. Shared by the stream workers and the agent gateway.
pub async fn process_event(
  environment_id: &str,
  environment_name: &str,
  incoming: IncomingEvent,
  dedup: &mut DedupCache,
) {
  if !action_allowed(&incoming.action) {
    return;
  }
  if is_filtered_container(
    incoming.image.as_deref(),
    incoming.container_name.as_deref(),
  ) {
    return;
  }
  let event = ContainerEvent {
    id: Uuid::new_v4().to_string(),
    environment_id: environment_id.to_string(),
    container_id: incoming.container_id,
    container_name: incoming.container_name,
    image: incoming.image,
    action: incoming.action,
    actor_attributes: incoming.actor_attributes,
    timestamp: if incoming.timestamp > 0 {
      incoming.timestamp
    } else {
      stevedore_timestamp()
    },
    time_nano: incoming.time_nano,
  };
  if !dedup.insert(event.dedup_key(), stevedore_timestamp()) {
    return;
  }

  if let Err(e) =
    store().container_events().insert(event.clone()).await
  {
    warn!(
      "failed to persist event for {environment_name} | {e:#}"
    );
  }
  broker().publish_container_event(event.clone());
  notify_best_effort(
    NotificationKind::ContainerEvent,
    json!({
      "environment": environment_name,
      "container": event.container_name,
      "action": event.action,
      "severity": severity_for_action(&event.action),
    }),
    Some(environment_id),
  )
  .await;
}

/// The long lived stream loop for one environment. Reconnects with
/// exponential backoff and reports online / offline transitions,
/// never per attempt.
pub async fn run_event_worker(
  environment: Environment,
  cancel: CancellationToken,
) {
  let mut dedup = DedupCache::default();
  let mut backoff = RECONNECT_MIN;
  // Three states: unknown at startup, then observed transitions.
  let mut online: Option<bool> = None;

  loop {
    if cancel.is_cancelled() {
      return;
    }
    let stream = async {
      let daemon = router::daemon_client(&environment.id).await?;
      let stream = daemon.container_event_stream().await?;
      anyhow::Ok((daemon, stream))
    }
    .await;

    let (daemon, mut stream) = match stream {
      Ok(pair) => pair,
      Err(e) => {
        set_online(&environment, &mut online, false, Some(&e)).await;
        if wait_backoff(&cancel, &mut backoff).await {
          return;
        }
        continue;
      }
    };

    // The stream opening is the first successful read.
    backoff = RECONNECT_MIN;
    set_online(&environment, &mut online, true, None).await;

    loop {
      let item = tokio::select! {
        item = stream.next() => item,
        _ = cancel.cancelled() => return,
      };
      match item {
        Some(Ok(event)) => {
          let actor = event.actor.unwrap_or_default();
          let attributes = actor.attributes.unwrap_or_default();
          let incoming = IncomingEvent {
            container_id: actor.id.unwrap_or_default(),
            container_name: attributes.get("name").cloned(),
            image: attributes.get("image").cloned(),
            action: event
              .action
              .clone()
              .unwrap_or_default(),
            actor_attributes: json!(attributes),
            timestamp: event
              .time
              .map(|secs| secs * 1000)
              .unwrap_or_default(),
            time_nano: event.time_nano.unwrap_or_default(),
          };
          process_event(
            &environment.id,
            &environment.name,
            incoming,
            &mut dedup,
          )
          .await;
        }
        Some(Err(e)) => {
          debug!(
            "event stream error for {} | {e:?}",
            daemon.environment_name
          );
          set_online(
            &environment,
            &mut online,
            false,
            Some(&anyhow::anyhow!("{e}")),
          )
          .await;
          break;
        }
        None => {
          set_online(
            &environment,
            &mut online,
            false,
            Some(&anyhow::anyhow!("event stream ended")),
          )
          .await;
          break;
        }
      }
    }

    if wait_backoff(&cancel, &mut backoff).await {
      return;
    }
  }
}

/// Returns true when cancelled during the wait.
async fn wait_backoff(
  cancel: &CancellationToken,
  backoff: &mut Duration,
) -> bool {
  let wait = *backoff;
  *backoff = (*backoff * 2).min(RECONNECT_MAX);
  tokio::select! {
    _ = tokio::time::sleep(wait) => false,
    _ = cancel.cancelled() => true,
  }
}

/// Emit status only on transitions.
async fn set_online(
  environment: &Environment,
  state: &mut Option<bool>,
  online: bool,
  error: Option<&anyhow::Error>,
) {
  if *state == Some(online) {
    return;
  }
  *state = Some(online);
  let error = error.map(|e| format!("{e:#}"));
  broker().publish_env_status(EnvStatus {
    environment_id: environment.id.clone(),
    name: environment.name.clone(),
    online,
    error: error.clone(),
  });
  let kind = if online {
    NotificationKind::EnvironmentOnline
  } else {
    NotificationKind::EnvironmentOffline
  };
  notify_best_effort(
    kind,
    json!({ "environment": environment.name, "error": error }),
    Some(&environment.id),
  )
  .await;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allowlist_covers_lifecycle_actions() {
    for action in
      ["create", "start", "die", "oom", "health_status"]
    {
      assert!(action_allowed(action), "{action}");
    }
    assert!(action_allowed("health_status: healthy"));
    for action in ["exec_create", "attach", "top", "archive-path"] {
      assert!(!action_allowed(action), "{action}");
    }
  }

  #[test]
  fn scanner_and_helper_containers_are_filtered() {
    assert!(is_filtered_container(
      Some("anchore/grype:latest"),
      None
    ));
    assert!(is_filtered_container(
      Some("aquasec/trivy:0.50"),
      None
    ));
    assert!(is_filtered_container(
      None,
      Some("stevedore-helper-vol1")
    ));
    assert!(!is_filtered_container(
      Some("nginx:1.25"),
      Some("web")
    ));
  }

  #[test]
  fn dedup_drops_repeats_inside_the_window() {
    let mut cache = DedupCache::default();
    assert!(cache.insert("k1".into(), 1_000));
    assert!(!cache.insert("k1".into(), 1_100));
    // Outside the window the key is fresh again.
    assert!(cache.insert("k1".into(), 7_000));
    assert!(cache.insert("k2".into(), 7_000));
  }

  #[test]
  fn dedup_prunes_when_over_capacity() {
    let mut cache = DedupCache::default();
    for i in 0..=DEDUP_MAX_ENTRIES {
      assert!(cache.insert(format!("k{i}"), 1_000));
    }
    // Next insert triggers the prune; the old window has passed so
    // the cache shrinks to just the new key.
    assert!(cache.insert("fresh".into(), 10_000));
    assert!(cache.entries.len() <= 2);
  }
}
