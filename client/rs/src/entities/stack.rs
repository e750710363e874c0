use serde::{Deserialize, Serialize};
use strum::Display;

/// Compose project names must be usable as `-p` arguments and
/// directory names.
pub fn valid_stack_name(name: &str) -> bool {
  !name.is_empty()
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Where a stack in an environment came from.
/// Dictates which lifecycle operations require a compose file
/// and which fall back to raw container operations.
#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum StackSource {
  /// Compose file owned and materialized by the control plane.
  Internal,
  /// Compose file is a working tree copy of a git repo.
  Git {
    git_repo_id: String,
    git_stack_id: String,
  },
  /// Discovered by compose project label only.
  #[default]
  External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSourceRecord {
  pub stack_name: String,
  pub environment_id: String,
  pub source: StackSource,
}

/// An environment variable override applied on stack deploy.
/// Takes precedence over any value from a repo `.env` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackEnvVar {
  pub stack_name: String,
  pub environment_id: String,
  pub key: String,
  pub value: String,
  #[serde(default)]
  pub is_secret: bool,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StackState {
  /// All containers are running.
  Running,
  /// All containers are stopped.
  Stopped,
  /// The containers are in a mix of states.
  Partial,
  #[default]
  Unknown,
}

/// Aggregates container running-ness into a stack state.
pub fn aggregate_stack_state(
  running: usize,
  total: usize,
) -> StackState {
  match (running, total) {
    (_, 0) => StackState::Unknown,
    (0, _) => StackState::Stopped,
    (r, t) if r == t => StackState::Running,
    _ => StackState::Partial,
  }
}

/// One stack as discovered on an environment, grouped by the
/// compose project label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackListItem {
  pub name: String,
  pub environment_id: String,
  pub state: StackState,
  pub source: StackSource,
  /// Container names belonging to the project.
  pub containers: Vec<StackContainer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackContainer {
  pub id: String,
  pub name: String,
  pub image: Option<String>,
  pub service: Option<String>,
  pub running: bool,
  pub status: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stack_name_charset() {
    assert!(valid_stack_name("my-stack_2"));
    assert!(!valid_stack_name(""));
    assert!(!valid_stack_name("has space"));
    assert!(!valid_stack_name("dot.name"));
    assert!(!valid_stack_name("slash/name"));
  }

  #[test]
  fn state_aggregation() {
    assert_eq!(aggregate_stack_state(3, 3), StackState::Running);
    assert_eq!(aggregate_stack_state(0, 2), StackState::Stopped);
    assert_eq!(aggregate_stack_state(1, 2), StackState::Partial);
    assert_eq!(aggregate_stack_state(0, 0), StackState::Unknown);
  }
}
