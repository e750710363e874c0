use serde::{Deserialize, Serialize};

/// A container an env update check found to be out of date.
/// Unique per `(environment_id, container_id)`; removed again
/// once the container is successfully updated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingContainerUpdate {
  pub environment_id: String,
  pub container_id: String,
  pub container_name: String,
  pub current_image: String,
  pub checked_at: i64,
}

/// Outcome of comparing the local image digests with the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateCheckOutcome {
  /// The image has no registry digest to compare, ie built locally.
  LocalImage,
  /// The registry could not be consulted. Transient.
  Error { message: String },
  /// The remote digest is already present locally.
  NoUpdate,
  UpdateAvailable { remote_digest: String },
}

/// What an env-wide update check does with its findings.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EnvUpdateMode {
  /// Record pending updates and notify only.
  #[default]
  Notify,
  /// Run the update pipeline for every outdated container.
  UpdateAll,
}
