use serde::{Deserialize, Serialize};

/// A git backed stack: which repo, branch and files drive a
/// compose project in one environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitStack {
  pub id: String,
  pub git_repo_id: String,
  pub stack_name: String,
  pub environment_id: String,
  pub remote_url: String,
  pub branch: String,
  /// Path to the compose file inside the repo. Required.
  pub compose_path: String,
  /// Optional env file read next to the compose file.
  /// When configured, a repo update forces container recreation
  /// so changed values actually land.
  #[serde(default)]
  pub env_file_path: Option<String>,
  #[serde(default)]
  pub credential_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCredential {
  pub id: String,
  pub auth: GitAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GitAuth {
  Https { username: String, password: String },
  Ssh { private_key: String },
}
