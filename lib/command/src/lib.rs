use std::{path::Path, process::Stdio, time::Duration};

use anyhow::Context;
use nix::{
  sys::signal::{Signal, killpg},
  unistd::Pid,
};
use run_command::{CommandOutput, async_run_command};
use stevedore_client::entities::{Log, stevedore_timestamp};
use tokio::io::AsyncReadExt;

/// Runs the command through `sh -c`, capturing output into a [Log].
/// No deadline; use [run_stage_with_deadline] for anything that can
/// hang on a remote daemon.
pub async fn run_stage(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Log {
  let command = if let Some(path) = path.into() {
    format!("cd {} && {}", path.display(), command.as_ref())
  } else {
    command.as_ref().to_string()
  };
  let start_ts = stevedore_timestamp();
  let output = async_run_command(&command).await;
  output_into_log(stage, command, start_ts, output)
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: CommandOutput,
) -> Log {
  let success = output.success();
  Log {
    stage: stage.to_string(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    success,
    start_ts,
    end_ts: stevedore_timestamp(),
  }
}

/// Runs the command in its own process group with extra environment
/// variables and a hard deadline. At the deadline the whole group gets
/// SIGTERM, then SIGKILL after the grace period. Timed out runs come
/// back with `success: false` and the timeout noted in stderr.
pub async fn run_stage_with_deadline(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: &str,
  envs: &[(String, String)],
  deadline: Duration,
  grace: Duration,
) -> Log {
  let start_ts = stevedore_timestamp();
  match run_group_with_deadline(
    path.into(),
    command,
    envs,
    deadline,
    grace,
  )
  .await
  {
    Ok((stdout, stderr, success, timed_out)) => {
      let mut stderr = stderr;
      if timed_out {
        if !stderr.is_empty() {
          stderr.push('\n');
        }
        stderr.push_str(&format!(
          "Timed out after {}s, process group killed",
          deadline.as_secs()
        ));
      }
      Log {
        stage: stage.to_string(),
        command: command.to_string(),
        stdout,
        stderr,
        success: success && !timed_out,
        start_ts,
        end_ts: stevedore_timestamp(),
      }
    }
    Err(e) => Log {
      stage: stage.to_string(),
      command: command.to_string(),
      stderr: format!("{e:#}"),
      success: false,
      start_ts,
      end_ts: stevedore_timestamp(),
      ..Default::default()
    },
  }
}

async fn run_group_with_deadline(
  path: Option<&Path>,
  command: &str,
  envs: &[(String, String)],
  deadline: Duration,
  grace: Duration,
) -> anyhow::Result<(String, String, bool, bool)> {
  let mut cmd = tokio::process::Command::new("sh");
  cmd
    .arg("-c")
    .arg(command)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    // Own group so the kill reaches compose's children too.
    .process_group(0);
  if let Some(path) = path {
    cmd.current_dir(path);
  }
  for (key, value) in envs {
    cmd.env(key, value);
  }

  let mut child =
    cmd.spawn().context("Failed to spawn child process")?;
  let pid = child
    .id()
    .map(|id| Pid::from_raw(id as i32))
    .context("Child process has no pid")?;

  let mut stdout_pipe =
    child.stdout.take().context("Child stdout not piped")?;
  let mut stderr_pipe =
    child.stderr.take().context("Child stderr not piped")?;
  let stdout_task = tokio::spawn(async move {
    let mut buf = Vec::new();
    let _ = stdout_pipe.read_to_end(&mut buf).await;
    buf
  });
  let stderr_task = tokio::spawn(async move {
    let mut buf = Vec::new();
    let _ = stderr_pipe.read_to_end(&mut buf).await;
    buf
  });

  let (status, timed_out) =
    match tokio::time::timeout(deadline, child.wait()).await {
      Ok(status) => {
        (Some(status.context("Failed to wait on child")?), false)
      }
      Err(_) => {
        let _ = killpg(pid, Signal::SIGTERM);
        let status =
          match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
              status.context("Failed to wait on child").ok()
            }
            Err(_) => {
              let _ = killpg(pid, Signal::SIGKILL);
              child.wait().await.ok()
            }
          };
        (status, true)
      }
    };

  let stdout = stdout_task.await.unwrap_or_default();
  let stderr = stderr_task.await.unwrap_or_default();

  Ok((
    String::from_utf8_lossy(&stdout).into_owned(),
    String::from_utf8_lossy(&stderr).into_owned(),
    status.map(|s| s.success()).unwrap_or(false),
    timed_out,
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn captures_stdout_and_success() {
    let log = run_stage("Echo", None, "echo hello").await;
    assert!(log.success);
    assert_eq!(log.stdout.trim(), "hello");
  }

  #[tokio::test]
  async fn nonzero_exit_is_failure() {
    let log = run_stage("False", None, "exit 3").await;
    assert!(!log.success);
  }

  #[tokio::test]
  async fn deadline_kills_the_group() {
    let log = run_stage_with_deadline(
      "Sleep",
      None,
      "sleep 30",
      &[],
      Duration::from_millis(200),
      Duration::from_millis(200),
    )
    .await;
    assert!(!log.success);
    assert!(log.stderr.contains("Timed out"));
  }

  #[tokio::test]
  async fn extra_envs_reach_the_child() {
    let log = run_stage_with_deadline(
      "Env",
      None,
      "printf '%s' \"$STEVEDORE_TEST_VAR\"",
      &[("STEVEDORE_TEST_VAR".to_string(), "42".to_string())],
      Duration::from_secs(5),
      Duration::from_secs(1),
    )
    .await;
    assert!(log.success);
    assert_eq!(log.stdout, "42");
  }
}
