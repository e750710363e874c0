//! Raw container operations on `com.docker.compose.project`
//! labels, used when a stack has no compose file to drive.

use anyhow::{Context, anyhow};
use bollard::models::ContainerSummary;
use futures::future::join_all;
use stevedore_client::entities::Log;

use crate::{
  router::{DaemonClient, daemon_client},
  state::store,
};

use super::{ComposeResult, ensure_valid_name, stack_locks, write};

pub const COMPOSE_PROJECT_LABEL: &str =
  "com.docker.compose.project";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContainerOp {
  Start,
  Stop,
  Restart,
}

async fn project_containers(
  daemon: &DaemonClient,
  name: &str,
) -> anyhow::Result<Vec<ContainerSummary>> {
  let containers = daemon
    .list_containers()
    .await
    .context("Failed to list containers")?;
  Ok(
    containers
      .into_iter()
      .filter(|container| {
        container
          .labels
          .as_ref()
          .and_then(|labels| labels.get(COMPOSE_PROJECT_LABEL))
          .map(|project| project == name)
          .unwrap_or(false)
      })
      .collect(),
  )
}

fn container_name(container: &ContainerSummary) -> String {
  container
    .names
    .as_ref()
    .and_then(|names| names.first())
    .map(|name| name.trim_start_matches('/').to_string())
    .or_else(|| container.id.clone())
    .unwrap_or_default()
}

/// Start / stop / restart every labeled container in parallel.
pub(crate) async fn containers_operation(
  environment_id: &str,
  name: &str,
  op: ContainerOp,
) -> anyhow::Result<ComposeResult> {
  let daemon = daemon_client(environment_id).await?;
  let containers = project_containers(&daemon, name).await?;
  if containers.is_empty() {
    return Err(anyhow!(
      "no containers labeled {COMPOSE_PROJECT_LABEL}={name} in this environment"
    ));
  }

  let ops = containers.iter().map(|container| {
    let daemon = daemon.clone();
    let id = container.id.clone().unwrap_or_default();
    let display = container_name(container);
    async move {
      let res = match op {
        ContainerOp::Start => daemon.start_container(&id).await,
        ContainerOp::Stop => {
          daemon.stop_container(&id, None).await
        }
        ContainerOp::Restart => {
          daemon.restart_container(&id, None).await
        }
      };
      match res {
        Ok(()) => Log::simple(
          "Container",
          format!("{display} ({id}): ok"),
        ),
        Err(e) => {
          Log::error("Container", format!("{display}: {e}"))
        }
      }
    }
  });
  let logs = join_all(ops).await;
  let success = logs.iter().all(|log| log.success);
  Ok(ComposeResult { success, logs })
}

/// Delete every labeled container in parallel, then the stack's
/// database rows and managed directory.
pub async fn remove_stack(
  environment_id: &str,
  name: &str,
) -> anyhow::Result<ComposeResult> {
  ensure_valid_name(name)?;
  let lock = stack_locks().get_lock(name.to_string()).await;
  let _guard = lock.lock().await;

  let daemon = daemon_client(environment_id).await?;
  let containers = project_containers(&daemon, name).await?;

  let removals = containers.iter().map(|container| {
    let daemon = daemon.clone();
    let id = container.id.clone().unwrap_or_default();
    let display = container_name(container);
    async move {
      match daemon.remove_container(&id, true).await {
        Ok(()) => Log::simple(
          "Remove Container",
          format!("{display} ({id}): removed"),
        ),
        Err(e) => Log::error(
          "Remove Container",
          format!("{display}: {e}"),
        ),
      }
    }
  });
  let mut logs = join_all(removals).await;
  let success = logs.iter().all(|log| log.success);

  if let Err(e) = store()
    .stack_sources()
    .remove(environment_id, name)
    .await
  {
    logs.push(Log::error(
      "Clean Records",
      format!("failed to remove stack source row | {e:#}"),
    ));
  }
  if let Err(e) = store()
    .stack_env_vars()
    .remove_for_stack(environment_id, name)
    .await
  {
    logs.push(Log::error(
      "Clean Records",
      format!("failed to remove stack env vars | {e:#}"),
    ));
  }
  if let Err(e) = write::remove_compose_dir(name).await {
    logs.push(Log::error(
      "Clean Records",
      format!("{e:#}"),
    ));
  }

  Ok(ComposeResult { success, logs })
}
