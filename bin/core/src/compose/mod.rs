//! Compose stack lifecycle. Operations for the same stack name are
//! serialized through a keyed lock; operations across stacks run
//! independently. A missing compose file downgrades start / stop /
//! restart to per-container operations on the project label.

use std::{path::PathBuf, sync::OnceLock, time::Duration};

use anyhow::{Context, anyhow};
use cache::TimeoutCache;
use command::run_stage_with_deadline;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use stevedore_client::entities::{
  EnvironmentVar, Log,
  environment::EnvironmentTransport,
  stack::{StackSource, valid_stack_name},
  stevedore_timestamp,
};

use crate::{
  config::core_config,
  router::{Connection, DaemonClient, daemon_client},
  state::store,
};

mod external;
mod list;
mod write;

pub use external::remove_stack;
pub use list::list_stacks;
pub use write::{
  compose_file_path, get_compose_file, save_compose_file,
};

/// Hard ceiling for one compose invocation, then SIGTERM.
pub const COMPOSE_TIMEOUT: Duration = Duration::from_secs(300);
/// Grace between SIGTERM and SIGKILL.
pub const COMPOSE_KILL_GRACE: Duration = Duration::from_secs(5);

/// FIFO keyed lock per stack name.
fn stack_locks() -> &'static TimeoutCache<String, ()> {
  static LOCKS: OnceLock<TimeoutCache<String, ()>> =
    OnceLock::new();
  LOCKS.get_or_init(Default::default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeOp {
  Up { force_recreate: bool },
  Down { remove_volumes: bool },
  Stop,
  Start,
  Restart,
  Pull,
}

impl ComposeOp {
  fn subcommand(&self) -> String {
    match self {
      ComposeOp::Up { force_recreate } => {
        let force = if *force_recreate {
          " --force-recreate"
        } else {
          ""
        };
        format!("up -d --remove-orphans{force}")
      }
      ComposeOp::Down { remove_volumes } => {
        let volumes =
          if *remove_volumes { " --volumes" } else { "" };
        format!("down{volumes}")
      }
      ComposeOp::Stop => String::from("stop"),
      ComposeOp::Start => String::from("start"),
      ComposeOp::Restart => String::from("restart"),
      ComposeOp::Pull => String::from("pull"),
    }
  }

  /// Ops that make sense as raw container calls when there is no
  /// compose file to drive.
  fn container_fallback(&self) -> Option<external::ContainerOp> {
    match self {
      ComposeOp::Start => Some(external::ContainerOp::Start),
      // Down on an unmanaged stack means stop.
      ComposeOp::Stop | ComposeOp::Down { .. } => {
        Some(external::ContainerOp::Stop)
      }
      ComposeOp::Restart => Some(external::ContainerOp::Restart),
      _ => None,
    }
  }
}

#[derive(Debug, Default, Serialize)]
pub struct ComposeResult {
  pub success: bool,
  pub logs: Vec<Log>,
}

/// Deploy: materialize the compose file if contents are given, then
/// `up -d`.
pub async fn deploy_stack(
  environment_id: &str,
  name: &str,
  compose_contents: Option<&str>,
  env_file_vars: &[EnvironmentVar],
  force_recreate: bool,
) -> anyhow::Result<ComposeResult> {
  ensure_valid_name(name)?;
  let lock = stack_locks().get_lock(name.to_string()).await;
  let _guard = lock.lock().await;

  if let Some(contents) = compose_contents {
    // Update if the slot is taken, create otherwise.
    let exists = compose_file_path(name).exists();
    write::save_compose_file_locked(name, contents, !exists)
      .await?;
  }

  run_compose(
    environment_id,
    name,
    ComposeOp::Up { force_recreate },
    env_file_vars,
  )
  .await
}

/// Lifecycle entry for everything except deploy / remove.
pub async fn stack_operation(
  environment_id: &str,
  name: &str,
  op: ComposeOp,
) -> anyhow::Result<ComposeResult> {
  ensure_valid_name(name)?;
  let lock = stack_locks().get_lock(name.to_string()).await;
  let _guard = lock.lock().await;
  run_compose(environment_id, name, op, &[]).await
}

pub(crate) fn ensure_valid_name(name: &str) -> anyhow::Result<()> {
  if valid_stack_name(name) {
    Ok(())
  } else {
    Err(anyhow!(
      "invalid stack name '{name}', expected [a-zA-Z0-9_-]+"
    ))
  }
}

/// Resolve where the stack's compose file lives, if anywhere.
async fn resolve_compose_file(
  environment_id: &str,
  name: &str,
) -> anyhow::Result<(Option<PathBuf>, StackSource)> {
  let source = store()
    .stack_sources()
    .get(environment_id, name)
    .await
    .context("Failed to query stack source")?
    .map(|record| record.source)
    .unwrap_or_default();
  // Deploys materialize the canonical copy under the stacks dir
  // for every managed source; prefer it, then fall back to the git
  // working tree.
  let materialized = compose_file_path(name);
  let path = if materialized.exists() {
    Some(materialized)
  } else if let StackSource::Git { git_stack_id, .. } = &source {
    store()
      .git_stacks()
      .get(git_stack_id)
      .await
      .context("Failed to query git stack")?
      .map(|git_stack| {
        git::repo_dir(
          &core_config().git_repos_dir,
          "stack",
          &git_stack.id,
        )
        .join(&git_stack.compose_path)
      })
      .filter(|path| path.exists())
  } else {
    None
  };
  Ok((path, source))
}

async fn run_compose(
  environment_id: &str,
  name: &str,
  op: ComposeOp,
  env_file_vars: &[EnvironmentVar],
) -> anyhow::Result<ComposeResult> {
  let (file, source) =
    resolve_compose_file(environment_id, name).await?;

  let Some(file) = file else {
    // No file to drive compose with.
    if matches!(source, StackSource::Internal) {
      return Err(anyhow!(
        "compose file for managed stack {name} is missing at {:?}",
        compose_file_path(name)
      ));
    }
    let Some(container_op) = op.container_fallback() else {
      return Err(anyhow!(
        "stack {name} has no compose file; only start / stop / restart / down are possible"
      ));
    };
    return external::containers_operation(
      environment_id,
      name,
      container_op,
    )
    .await;
  };

  let daemon = daemon_client(environment_id).await?;
  let envs =
    merged_env_vars(environment_id, name, env_file_vars).await?;

  match &daemon.connection {
    Connection::Local(_) => {
      let log = run_compose_local(
        &daemon,
        name,
        &file,
        op,
        &envs,
      )
      .await;
      let success = log.success;
      Ok(ComposeResult {
        success,
        logs: vec![log],
      })
    }
    // Compose has to run next to the daemon; hand the whole job to
    // the agent.
    _ => {
      run_compose_via_agent(&daemon, name, &file, op, &envs).await
    }
  }
}

fn docker_compose() -> &'static str {
  if core_config().legacy_compose_cli {
    "docker-compose"
  } else {
    "docker compose"
  }
}

async fn run_compose_local(
  daemon: &DaemonClient,
  name: &str,
  file: &std::path::Path,
  op: ComposeOp,
  envs: &IndexMap<String, String>,
) -> Log {
  let docker_compose = docker_compose();
  let command = format!(
    "{docker_compose} -p {name} -f {} {}",
    file.display(),
    op.subcommand()
  );

  let mut child_env = envs
    .iter()
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect::<Vec<_>>();
  if let Some(docker_host) = docker_host_for(daemon) {
    child_env.push((String::from("DOCKER_HOST"), docker_host));
  }

  run_stage_with_deadline(
    "Compose",
    None,
    &command,
    &child_env,
    COMPOSE_TIMEOUT,
    COMPOSE_KILL_GRACE,
  )
  .await
}

fn docker_host_for(daemon: &DaemonClient) -> Option<String> {
  match &daemon.transport {
    EnvironmentTransport::Socket { socket_path } => socket_path
      .as_ref()
      .map(|path| format!("unix://{path}")),
    EnvironmentTransport::Direct { host, port, .. } => {
      Some(format!("tcp://{host}:{port}"))
    }
    _ => None,
  }
}

/// Process env, then env file vars, then db vars; later wins.
async fn merged_env_vars(
  environment_id: &str,
  name: &str,
  env_file_vars: &[EnvironmentVar],
) -> anyhow::Result<IndexMap<String, String>> {
  let mut merged = IndexMap::new();
  for var in env_file_vars {
    merged.insert(var.variable.clone(), var.value.clone());
  }
  let db_vars = store()
    .stack_env_vars()
    .list(environment_id, name)
    .await
    .context("Failed to load stack env vars")?;
  for var in db_vars {
    merged.insert(var.key, var.value);
  }
  Ok(merged)
}

#[derive(Serialize)]
struct AgentComposeRequest<'a> {
  project: &'a str,
  command: String,
  compose_file: String,
  env: &'a IndexMap<String, String>,
  timeout_secs: u64,
}

#[derive(Deserialize)]
struct AgentComposeResponse {
  success: bool,
  #[serde(default)]
  stdout: String,
  #[serde(default)]
  stderr: String,
}

/// Ship the compose file and env to the agent so compose executes
/// next to the daemon.
async fn run_compose_via_agent(
  daemon: &DaemonClient,
  name: &str,
  file: &std::path::Path,
  op: ComposeOp,
  envs: &IndexMap<String, String>,
) -> anyhow::Result<ComposeResult> {
  let start_ts = stevedore_timestamp();
  let compose_file = tokio::fs::read_to_string(file)
    .await
    .with_context(|| {
      format!("Failed to read compose file at {file:?}")
    })?;
  let request = AgentComposeRequest {
    project: name,
    command: op.subcommand(),
    compose_file,
    env: envs,
    timeout_secs: COMPOSE_TIMEOUT.as_secs(),
  };
  let body = serde_json::to_value(&request)
    .context("Failed to serialize compose request")?;
  let response: AgentComposeResponse = daemon
    .raw_json(
      "POST",
      "/_stevedore/compose",
      Some(body),
      COMPOSE_TIMEOUT + COMPOSE_KILL_GRACE,
    )
    .await
    .context("Agent compose call failed")?;
  let log = Log {
    stage: String::from("Compose"),
    command: format!(
      "{} -p {name} {}",
      docker_compose(),
      op.subcommand()
    ),
    stdout: response.stdout,
    stderr: response.stderr,
    success: response.success,
    start_ts,
    end_ts: stevedore_timestamp(),
  };
  Ok(ComposeResult {
    success: log.success,
    logs: vec![log],
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn subcommands_carry_op_flags() {
    assert_eq!(
      ComposeOp::Up {
        force_recreate: false
      }
      .subcommand(),
      "up -d --remove-orphans"
    );
    assert_eq!(
      ComposeOp::Up {
        force_recreate: true
      }
      .subcommand(),
      "up -d --remove-orphans --force-recreate"
    );
    assert_eq!(
      ComposeOp::Down {
        remove_volumes: true
      }
      .subcommand(),
      "down --volumes"
    );
    assert_eq!(
      ComposeOp::Down {
        remove_volumes: false
      }
      .subcommand(),
      "down"
    );
    assert_eq!(ComposeOp::Pull.subcommand(), "pull");
  }

  #[test]
  fn fallback_ops_for_unmanaged_stacks() {
    assert!(
      ComposeOp::Up {
        force_recreate: false
      }
      .container_fallback()
      .is_none()
    );
    assert!(ComposeOp::Pull.container_fallback().is_none());
    assert_eq!(
      ComposeOp::Down {
        remove_volumes: false
      }
      .container_fallback(),
      Some(external::ContainerOp::Stop)
    );
    assert_eq!(
      ComposeOp::Restart.container_fallback(),
      Some(external::ContainerOp::Restart)
    );
  }

  #[test]
  fn name_validation_rejects_path_tricks() {
    assert!(ensure_valid_name("web-stack_1").is_ok());
    assert!(ensure_valid_name("../escape").is_err());
    assert!(ensure_valid_name("a b").is_err());
  }
}
