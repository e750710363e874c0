//! The auto-update pipeline: registry digest check, safe pull +
//! scan + criteria, and recreation of the container on the approved
//! image.

use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use dashmap::DashSet;
use futures::future::join_all;
use serde_json::{Value, json};
use stevedore_client::entities::{
  environment::Environment,
  schedule::{
    ExecutionStatus, ExecutionTrigger, Schedule, ScheduleKind,
  },
  stevedore_timestamp,
  update::{EnvUpdateMode, PendingContainerUpdate, UpdateCheckOutcome},
};

use crate::{
  execution::{self, ExecutionHandle},
  notify::{NotificationKind, notify_best_effort},
  registry::{
    RegistryError, digest_matches_local, fetch_remote_digest,
    split_image_reference,
  },
  router::{DaemonClient, TransportError, daemon_client},
  state::store,
};

mod recreate;
mod safe_pull;
mod scan;

pub use scan::cleanup_helper_containers;

/// Updating the control plane's own container out from under itself
/// is never worth it.
const SELF_IMAGE_SUBSTRING: &str = "stevedore";

/// How one update run ended, for the execution row.
#[derive(Debug)]
pub enum UpdateOutcome {
  Updated {
    container: String,
    old_image_id: String,
    new_image_id: String,
  },
  Skipped {
    reason: String,
  },
}

/// Fired by a `container_update` schedule.
pub async fn run_container_update_job(
  schedule: &Schedule,
  trigger: ExecutionTrigger,
) -> anyhow::Result<()> {
  let environment_id = schedule
    .environment_id
    .as_deref()
    .context("container update schedule has no environment")?;
  let container_id = schedule
    .payload
    .get("container_id")
    .and_then(Value::as_str)
    .context("container update schedule has no container_id")?;
  let container_name = schedule
    .payload
    .get("container_name")
    .and_then(Value::as_str)
    .unwrap_or(container_id);

  let environment = store()
    .environments()
    .get(environment_id)
    .await?
    .with_context(|| {
      format!("no environment with id {environment_id}")
    })?;

  let handle = execution::begin(
    ScheduleKind::ContainerUpdate,
    &schedule.id,
    Some(environment_id),
    container_name,
    trigger,
  )
  .await?;

  match update_container(&environment, container_id, &handle).await
  {
    Ok(UpdateOutcome::Updated {
      container,
      old_image_id,
      new_image_id,
    }) => {
      handle
        .finish(
          ExecutionStatus::Success,
          None,
          json!({
            "container": container,
            "old_image_id": old_image_id,
            "new_image_id": new_image_id,
          }),
        )
        .await;
      Ok(())
    }
    Ok(UpdateOutcome::Skipped { reason }) => {
      handle
        .finish(
          ExecutionStatus::Skipped,
          None,
          json!({ "reason": reason }),
        )
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

/// The single-container pipeline. The rollback invariant: until the
/// recreate step, the original tag always resolves to the image the
/// container is running.
pub async fn update_container(
  environment: &Environment,
  container_id: &str,
  handle: &ExecutionHandle,
) -> anyhow::Result<UpdateOutcome> {
  let daemon = daemon_client(&environment.id).await?;

  let inspect = match daemon.inspect_container(container_id).await {
    Ok(inspect) => inspect,
    Err(TransportError::NotFound(message)) => {
      return Err(anyhow!("container not found: {message}"));
    }
    Err(e) => return Err(e).context("Failed to inspect container"),
  };
  let reference = inspect
    .config
    .as_ref()
    .and_then(|config| config.image.clone())
    .context("container has no image reference")?;
  let container_name = inspect
    .name
    .clone()
    .map(|name| name.trim_start_matches('/').to_string())
    .unwrap_or_else(|| container_id.to_string());
  let old_image_id = inspect
    .image
    .clone()
    .context("container has no image id")?;

  if reference.contains(SELF_IMAGE_SUBSTRING) {
    return Ok(UpdateOutcome::Skipped {
      reason: String::from("refusing to update the control plane"),
    });
  }

  handle
    .log(format!(
      "checking registry for {container_name} ({reference})"
    ))
    .await;
  match check_image_update(&daemon, &reference).await {
    UpdateCheckOutcome::LocalImage => {
      return Ok(UpdateOutcome::Skipped {
        reason: String::from(
          "image has no registry digest (built locally)",
        ),
      });
    }
    UpdateCheckOutcome::Error { message } => {
      // Transient: the next fire will try again.
      return Ok(UpdateOutcome::Skipped {
        reason: format!("registry check failed: {message}"),
      });
    }
    UpdateCheckOutcome::NoUpdate => {
      return Ok(UpdateOutcome::Skipped {
        reason: String::from("image is up to date"),
      });
    }
    UpdateCheckOutcome::UpdateAvailable { remote_digest } => {
      handle
        .log(format!("update available: {remote_digest}"))
        .await;
    }
  }

  let parsed = split_image_reference(&reference);
  let use_safe_pull =
    environment.scanner.enabled() && parsed.digest.is_none();

  let new_image_id = if use_safe_pull {
    match safe_pull::safe_pull(
      &daemon,
      environment,
      &reference,
      &old_image_id,
      handle,
    )
    .await?
    {
      safe_pull::SafePullOutcome::Approved { new_image_id } => {
        new_image_id
      }
      safe_pull::SafePullOutcome::Blocked { counts } => {
        return Ok(UpdateOutcome::Skipped {
          reason: format!(
            "vulnerabilities_found ({} critical, {} high)",
            counts.critical, counts.high
          ),
        });
      }
      safe_pull::SafePullOutcome::AlreadyCurrent => {
        return Ok(UpdateOutcome::Skipped {
          reason: String::from("pull produced the running image"),
        });
      }
    }
  } else {
    handle.log(format!("pulling {reference}")).await;
    daemon
      .pull_image(&reference)
      .await
      .context("Failed to pull image")?;
    daemon
      .inspect_image(&reference)
      .await
      .context("Failed to inspect pulled image")?
      .id
      .context("pulled image has no id")?
  };

  if new_image_id == old_image_id {
    return Ok(UpdateOutcome::Skipped {
      reason: String::from("pull produced the running image"),
    });
  }

  let recreated = recreate::recreate_container(
    &daemon,
    inspect,
    &reference,
    handle,
  )
  .await?;

  if let Err(e) = store()
    .pending_updates()
    .remove(&environment.id, container_id)
    .await
  {
    warn!("failed to clear pending update row | {e:#}");
  }
  notify_best_effort(
    NotificationKind::AutoUpdateSuccess,
    json!({
      "environment": environment.name,
      "container": recreated.name,
      "image": reference,
    }),
    Some(&environment.id),
  )
  .await;

  Ok(UpdateOutcome::Updated {
    container: recreated.name,
    old_image_id,
    new_image_id,
  })
}

/// Compare local RepoDigests with the registry's manifest digest.
pub async fn check_image_update(
  daemon: &DaemonClient,
  reference: &str,
) -> UpdateCheckOutcome {
  let repo_digests = match daemon.inspect_image(reference).await {
    Ok(image) => image.repo_digests.unwrap_or_default(),
    Err(e) => {
      return UpdateCheckOutcome::Error {
        message: format!("failed to inspect local image: {e}"),
      };
    }
  };
  if repo_digests.is_empty() {
    return UpdateCheckOutcome::LocalImage;
  }
  let parsed = split_image_reference(reference);
  match fetch_remote_digest(&parsed).await {
    Ok(remote_digest) => {
      if digest_matches_local(&remote_digest, &repo_digests) {
        UpdateCheckOutcome::NoUpdate
      } else {
        UpdateCheckOutcome::UpdateAvailable { remote_digest }
      }
    }
    Err(RegistryError::RateLimited) => {
      // Expected on the hub; stay quiet.
      debug!("registry rate limited the check for {reference}");
      UpdateCheckOutcome::Error {
        message: String::from("registry rate limited"),
      }
    }
    Err(RegistryError::Other(e)) => UpdateCheckOutcome::Error {
      message: format!("{e:#}"),
    },
  }
}

/// Environments with a check already in flight; concurrent fires
/// are dropped rather than queued.
fn env_checks_running() -> &'static DashSet<String> {
  static RUNNING: OnceLock<DashSet<String>> = OnceLock::new();
  RUNNING.get_or_init(Default::default)
}

/// Fired by an `env_update_check` schedule: check every container
/// in the environment, maintain the pending update rows, and either
/// notify or update everything outdated.
pub async fn run_env_update_check_job(
  schedule: &Schedule,
  trigger: ExecutionTrigger,
) -> anyhow::Result<()> {
  let environment_id = schedule
    .environment_id
    .as_deref()
    .context("env update check schedule has no environment")?;
  if !env_checks_running().insert(environment_id.to_string()) {
    debug!(
      "env update check already running for {environment_id}, dropping fire"
    );
    return Ok(());
  }
  let res =
    run_env_update_check(schedule, environment_id, trigger).await;
  env_checks_running().remove(environment_id);
  res
}

async fn run_env_update_check(
  schedule: &Schedule,
  environment_id: &str,
  trigger: ExecutionTrigger,
) -> anyhow::Result<()> {
  let environment = store()
    .environments()
    .get(environment_id)
    .await?
    .with_context(|| {
      format!("no environment with id {environment_id}")
    })?;
  let mode = schedule
    .payload
    .get("mode")
    .and_then(|mode| {
      serde_json::from_value::<EnvUpdateMode>(mode.clone()).ok()
    })
    .unwrap_or_default();

  let handle = execution::begin(
    ScheduleKind::EnvUpdateCheck,
    &schedule.id,
    Some(environment_id),
    &environment.name,
    trigger,
  )
  .await?;

  let res =
    env_check_inner(&environment, mode, &handle).await;
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

async fn env_check_inner(
  environment: &Environment,
  mode: EnvUpdateMode,
  handle: &ExecutionHandle,
) -> anyhow::Result<Value> {
  let daemon = daemon_client(&environment.id).await?;
  let containers = daemon
    .list_containers()
    .await
    .context("Failed to list containers")?;

  struct Candidate {
    id: String,
    name: String,
    image: String,
  }
  let candidates = containers
    .into_iter()
    .filter_map(|container| {
      let id = container.id?;
      let image = container.image?;
      if image.contains(SELF_IMAGE_SUBSTRING) {
        return None;
      }
      let name = container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
      Some(Candidate { id, name, image })
    })
    .collect::<Vec<_>>();

  let checked = candidates.len();
  handle
    .log(format!("checking {checked} containers for updates"))
    .await;

  // All-settled: one unreachable registry must not sink the run.
  let results = join_all(candidates.iter().map(|candidate| {
    let daemon = daemon.clone();
    async move {
      check_image_update(&daemon, &candidate.image).await
    }
  }))
  .await;

  let now = stevedore_timestamp();
  let mut outdated = Vec::new();
  for (candidate, outcome) in candidates.iter().zip(results) {
    if let UpdateCheckOutcome::UpdateAvailable { .. } = outcome {
      outdated.push(candidate);
      if let Err(e) = store()
        .pending_updates()
        .upsert(PendingContainerUpdate {
          environment_id: environment.id.clone(),
          container_id: candidate.id.clone(),
          container_name: candidate.name.clone(),
          current_image: candidate.image.clone(),
          checked_at: now,
        })
        .await
      {
        warn!("failed to upsert pending update | {e:#}");
      }
    }
  }
  // Rows not re-confirmed by this check are stale.
  let keep = outdated
    .iter()
    .map(|candidate| candidate.id.clone())
    .collect::<Vec<_>>();
  store()
    .pending_updates()
    .retain(&environment.id, &keep)
    .await
    .context("Failed to prune pending updates")?;

  let mut updated = 0usize;
  let mut blocked = 0usize;
  let mut failed = 0usize;
  match mode {
    EnvUpdateMode::Notify => {
      if !outdated.is_empty() {
        notify_best_effort(
          NotificationKind::AutoUpdateAvailable,
          json!({
            "environment": environment.name,
            "containers": outdated
              .iter()
              .map(|candidate| candidate.name.clone())
              .collect::<Vec<_>>(),
          }),
          Some(&environment.id),
        )
        .await;
      }
    }
    EnvUpdateMode::UpdateAll => {
      for candidate in &outdated {
        handle
          .log(format!("updating {}", candidate.name))
          .await;
        match update_container(environment, &candidate.id, handle)
          .await
        {
          Ok(UpdateOutcome::Updated { .. }) => updated += 1,
          Ok(UpdateOutcome::Skipped { reason }) => {
            if reason.starts_with("vulnerabilities_found") {
              blocked += 1;
            }
            handle
              .log(format!(
                "{} skipped: {reason}",
                candidate.name
              ))
              .await;
          }
          Err(e) => {
            failed += 1;
            handle
              .log(format!("{} failed: {e:#}", candidate.name))
              .await;
          }
        }
      }
    }
  }

  Ok(json!({
    "mode": mode,
    "summary": {
      "checked": checked,
      "outdated": outdated.len(),
      "updated": updated,
      "blocked": blocked,
      "failed": failed,
    },
    "containers": outdated
      .iter()
      .map(|candidate| json!({
        "id": candidate.id,
        "name": candidate.name,
        "image": candidate.image,
      }))
      .collect::<Vec<_>>(),
  }))
}
