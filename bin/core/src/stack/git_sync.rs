//! Git backed stacks: refresh the working tree, hand the compose
//! file to the compose engine, record provenance.

use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use cache::TimeoutCache;
use git::GitCredentials;
use serde_json::{Value, json};
use stevedore_client::entities::{
  EnvironmentVar, all_logs_success, environment_vars_from_str,
  git::{GitAuth, GitStack},
  schedule::{
    ExecutionStatus, ExecutionTrigger, Schedule, ScheduleKind,
  },
  stack::{StackSource, StackSourceRecord},
};

use crate::{
  compose,
  config::core_config,
  execution::{self, ExecutionHandle},
  state::store,
};

/// Serializes syncs per git stack; compose operations serialize
/// separately on the stack name.
fn sync_locks() -> &'static TimeoutCache<String, ()> {
  static LOCKS: OnceLock<TimeoutCache<String, ()>> =
    OnceLock::new();
  LOCKS.get_or_init(Default::default)
}

pub async fn run_git_sync_job(
  schedule: &Schedule,
  trigger: ExecutionTrigger,
) -> anyhow::Result<()> {
  let git_stack_id = schedule
    .payload
    .get("git_stack_id")
    .and_then(Value::as_str)
    .context("git sync schedule has no git_stack_id")?;
  let git_stack = store()
    .git_stacks()
    .get(git_stack_id)
    .await?
    .with_context(|| {
      format!("no git stack with id {git_stack_id}")
    })?;

  let handle = execution::begin(
    ScheduleKind::GitStackSync,
    &schedule.id,
    Some(&git_stack.environment_id),
    &git_stack.stack_name,
    trigger,
  )
  .await?;

  match sync_git_stack(&git_stack, &handle).await {
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

pub async fn sync_git_stack(
  git_stack: &GitStack,
  handle: &ExecutionHandle,
) -> anyhow::Result<Value> {
  let lock =
    sync_locks().get_lock(git_stack.id.clone()).await;
  let _guard = lock.lock().await;

  let credentials = load_credentials(git_stack).await?;
  let destination = git::repo_dir(
    &core_config().git_repos_dir,
    "stack",
    &git_stack.id,
  );

  let res = git::ensure_repo(
    &destination,
    &git_stack.remote_url,
    &git_stack.branch,
    &credentials,
  )
  .await
  .context("Failed to refresh repo")?;
  for log in &res.logs {
    handle
      .log(format!("{}: {}", log.stage, log.combined()))
      .await;
  }
  if !all_logs_success(&res.logs) {
    return Err(anyhow!("git refresh failed, see execution logs"));
  }
  let commit = res.hash.clone().unwrap_or_default();
  handle
    .log(format!(
      "at commit {commit} (updated: {})",
      res.updated
    ))
    .await;

  let compose_path = destination.join(&git_stack.compose_path);
  let compose_contents = tokio::fs::read_to_string(&compose_path)
    .await
    .with_context(|| {
      format!("Failed to read compose file at {compose_path:?}")
    })?;

  let env_file_vars =
    read_env_file(git_stack, &destination, handle).await?;

  // When only env values changed the compose config is identical,
  // so compose would leave containers untouched; force recreation
  // whenever the repo moved and an env file drives the stack.
  let force_recreate =
    res.updated && git_stack.env_file_path.is_some();

  let result = compose::deploy_stack(
    &git_stack.environment_id,
    &git_stack.stack_name,
    Some(&compose_contents),
    &env_file_vars,
    force_recreate,
  )
  .await?;
  for log in &result.logs {
    handle
      .log(format!("{}: {}", log.stage, log.combined()))
      .await;
  }
  if !result.success {
    return Err(anyhow!("compose deploy failed"));
  }

  store()
    .stack_sources()
    .upsert(StackSourceRecord {
      stack_name: git_stack.stack_name.clone(),
      environment_id: git_stack.environment_id.clone(),
      source: StackSource::Git {
        git_repo_id: git_stack.git_repo_id.clone(),
        git_stack_id: git_stack.id.clone(),
      },
    })
    .await
    .context("Failed to record stack source")?;

  Ok(json!({
    "commit": commit,
    "repo_updated": res.updated,
    "force_recreate": force_recreate,
  }))
}

async fn load_credentials(
  git_stack: &GitStack,
) -> anyhow::Result<GitCredentials> {
  let Some(credential_id) = &git_stack.credential_id else {
    return Ok(GitCredentials::None);
  };
  let credential = store()
    .git_stacks()
    .get_credential(credential_id)
    .await?
    .with_context(|| {
      format!("no git credential with id {credential_id}")
    })?;
  Ok(match credential.auth {
    GitAuth::Https { username, password } => {
      GitCredentials::Https { username, password }
    }
    GitAuth::Ssh { private_key } => GitCredentials::Ssh {
      credential_id: credential.id,
      private_key,
      key_dir: core_config().git_repos_dir.clone(),
    },
  })
}

async fn read_env_file(
  git_stack: &GitStack,
  destination: &std::path::Path,
  handle: &ExecutionHandle,
) -> anyhow::Result<Vec<EnvironmentVar>> {
  let Some(env_file_path) = &git_stack.env_file_path else {
    return Ok(Vec::new());
  };
  let path = destination.join(env_file_path);
  match tokio::fs::read_to_string(&path).await {
    Ok(contents) => environment_vars_from_str(&contents)
      .with_context(|| {
        format!("invalid env file at {env_file_path}")
      }),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      handle
        .log(format!(
          "env file {env_file_path} not present in repo"
        ))
        .await;
      Ok(Vec::new())
    }
    Err(e) => Err(e).with_context(|| {
      format!("Failed to read env file at {path:?}")
    }),
  }
}
