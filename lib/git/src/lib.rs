//! Shallow working tree management for git backed stacks.
//!
//! Clones are `--depth 1`; refreshes are `fetch --depth=1` plus a hard
//! reset, so local state can never diverge from the remote branch.

#[macro_use]
extern crate tracing;

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use command::run_stage;
use stevedore_client::entities::{Log, all_logs_success};

mod credentials;

pub use credentials::{GitCredentials, SshKeyGuard};

#[derive(Debug, Clone)]
pub struct GitRes {
  pub logs: Vec<Log>,
  /// Short commit hash after the operation.
  pub hash: Option<String>,
  pub message: Option<String>,
  /// Whether the working tree changed (fresh clone or new commits).
  pub updated: bool,
}

/// Clone the branch if the destination does not exist, otherwise
/// fetch and hard reset onto the remote branch head.
pub async fn ensure_repo(
  destination: &Path,
  remote_url: &str,
  branch: &str,
  credentials: &GitCredentials,
) -> anyhow::Result<GitRes> {
  if destination.join(".git").exists() {
    refresh_repo(destination, remote_url, branch, credentials).await
  } else {
    clone_repo(destination, remote_url, branch, credentials).await
  }
}

async fn clone_repo(
  destination: &Path,
  remote_url: &str,
  branch: &str,
  credentials: &GitCredentials,
) -> anyhow::Result<GitRes> {
  let (url, ssh_guard) =
    credentials.apply(remote_url).await.context(
      "Failed to prepare git credentials",
    )?;
  let env = ssh_guard
    .as_ref()
    .map(|guard| format!("GIT_SSH_COMMAND='{}' ", guard.ssh_command()))
    .unwrap_or_default();

  let mut log = run_stage(
    "Clone Repo",
    None,
    format!(
      "{env}git clone --depth 1 {url} {} -b {branch}",
      destination.display()
    ),
  )
  .await;
  credentials.sanitize(&mut log);
  let success = log.success;
  let mut logs = vec![log];

  if !success {
    // Never leave a half written clone behind.
    if let Err(e) = tokio::fs::remove_dir_all(destination).await
      && e.kind() != std::io::ErrorKind::NotFound
    {
      warn!(
        "failed to clean up failed clone at {destination:?} | {e:?}"
      );
    }
    return Ok(GitRes {
      logs,
      hash: None,
      message: None,
      updated: false,
    });
  }

  let (hash, message) =
    push_commit_hash_log(destination, &mut logs).await;

  Ok(GitRes {
    logs,
    hash,
    message,
    updated: true,
  })
}

async fn refresh_repo(
  destination: &Path,
  remote_url: &str,
  branch: &str,
  credentials: &GitCredentials,
) -> anyhow::Result<GitRes> {
  let (url, ssh_guard) =
    credentials.apply(remote_url).await.context(
      "Failed to prepare git credentials",
    )?;
  let env = ssh_guard
    .as_ref()
    .map(|guard| format!("GIT_SSH_COMMAND='{}' ", guard.ssh_command()))
    .unwrap_or_default();

  let mut logs = Vec::new();

  let before = commit_hash(destination).await.ok();

  let mut set_remote = run_stage(
    "Set Remote",
    destination,
    format!("git remote set-url origin {url}"),
  )
  .await;
  credentials.sanitize(&mut set_remote);
  logs.push(set_remote);
  if !all_logs_success(&logs) {
    return Ok(GitRes {
      logs,
      hash: before,
      message: None,
      updated: false,
    });
  }

  let mut fetch = run_stage(
    "Fetch",
    destination,
    format!("{env}git fetch --depth=1 origin {branch}"),
  )
  .await;
  credentials.sanitize(&mut fetch);
  logs.push(fetch);
  if !all_logs_success(&logs) {
    return Ok(GitRes {
      logs,
      hash: before,
      message: None,
      updated: false,
    });
  }

  let reset = run_stage(
    "Reset",
    destination,
    format!("git reset --hard origin/{branch}"),
  )
  .await;
  logs.push(reset);
  if !all_logs_success(&logs) {
    return Ok(GitRes {
      logs,
      hash: before,
      message: None,
      updated: false,
    });
  }

  let (hash, message) =
    push_commit_hash_log(destination, &mut logs).await;

  let updated = match (&before, &hash) {
    (Some(before), Some(after)) => before != after,
    _ => true,
  };

  Ok(GitRes {
    logs,
    hash,
    message,
    updated,
  })
}

/// Short hash of HEAD.
pub async fn commit_hash(repo: &Path) -> anyhow::Result<String> {
  let log =
    run_stage("Latest Commit", repo, "git rev-parse --short HEAD")
      .await;
  if !log.success {
    return Err(
      anyhow!("{}", log.stderr.trim())
        .context("Failed to read latest commit hash"),
    );
  }
  Ok(log.stdout.trim().to_string())
}

async fn push_commit_hash_log(
  repo: &Path,
  logs: &mut Vec<Log>,
) -> (Option<String>, Option<String>) {
  let log = run_stage(
    "Latest Commit",
    repo,
    "git log -1 --pretty=format:\"%h: %s\"",
  )
  .await;
  let res = if log.success {
    log
      .stdout
      .trim()
      .split_once(": ")
      .map(|(hash, message)| {
        (Some(hash.to_string()), Some(message.to_string()))
      })
      .unwrap_or((None, None))
  } else {
    (None, None)
  };
  logs.push(log);
  res
}

/// Remove a clone directory entirely.
pub async fn remove_repo(destination: &Path) -> anyhow::Result<()> {
  match tokio::fs::remove_dir_all(destination).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e).with_context(|| {
      format!("Failed to remove repo at {destination:?}")
    }),
  }
}

pub fn repo_dir(root: &Path, prefix: &str, id: &str) -> PathBuf {
  root.join(format!("{prefix}-{id}"))
}
