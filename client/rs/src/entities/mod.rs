use anyhow::Context;
use async_timing_util::unix_timestamp_ms;
use serde::{Deserialize, Serialize};

pub mod environment;
pub mod event;
pub mod git;
pub mod logger;
pub mod scan;
pub mod schedule;
pub mod stack;
pub mod update;

/// Unix timestamp in milliseconds as i64
pub fn stevedore_timestamp() -> i64 {
  unix_timestamp_ms() as i64
}

#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct EnvironmentVar {
  pub variable: String,
  pub value: String,
}

/// Parses a dotenv-style key value list.
/// Full line comments (`# ...`) and empty lines are skipped,
/// surrounding single / double quotes on values are stripped.
pub fn environment_vars_from_str(
  input: &str,
) -> anyhow::Result<Vec<EnvironmentVar>> {
  input
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty() && !line.starts_with('#'))
    .map(|line| {
      let (variable, value) = line
        .split_once('=')
        .with_context(|| format!("invalid env line: {line}"))?;
      let value = value.trim();
      let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| {
          value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
        })
        .unwrap_or(value);
      Ok(EnvironmentVar {
        variable: variable.trim().to_string(),
        value: value.to_string(),
      })
    })
    .collect()
}

/// The output of one stage of a longer running operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl Log {
  pub fn simple(stage: &str, msg: String) -> Log {
    let ts = stevedore_timestamp();
    Log {
      stage: stage.to_string(),
      stdout: msg,
      success: true,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  pub fn error(stage: &str, msg: String) -> Log {
    let ts = stevedore_timestamp();
    Log {
      stage: stage.to_string(),
      stderr: msg,
      success: false,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  pub fn combined(&self) -> String {
    match (self.stdout.is_empty(), self.stderr.is_empty()) {
      (true, true) => String::new(),
      (false, true) => self.stdout.clone(),
      (true, false) => self.stderr.clone(),
      (false, false) => {
        format!("stdout: {}\nstderr: {}", self.stdout, self.stderr)
      }
    }
  }
}

pub fn all_logs_success(logs: &[Log]) -> bool {
  logs.iter().all(|log| log.success)
}

pub fn optional_string(string: &str) -> Option<String> {
  if string.is_empty() {
    None
  } else {
    Some(string.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_env_lines_skipping_comments() {
    let vars = environment_vars_from_str(
      "# comment\nFOO=1\n\nBAR = \"two words\"\nBAZ='x'\n",
    )
    .unwrap();
    assert_eq!(
      vars,
      vec![
        EnvironmentVar {
          variable: "FOO".into(),
          value: "1".into()
        },
        EnvironmentVar {
          variable: "BAR".into(),
          value: "two words".into()
        },
        EnvironmentVar {
          variable: "BAZ".into(),
          value: "x".into()
        },
      ]
    );
  }

  #[test]
  fn rejects_lines_without_equals() {
    assert!(environment_vars_from_str("NOT A VAR").is_err());
  }
}
