use anyhow::anyhow;
use async_trait::async_trait;

/// The authorization seam. `(user, resource, action, env)` in,
/// allow / deny out.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
  async fn allow(
    &self,
    user_id: &str,
    resource: &str,
    action: &str,
    environment_id: Option<&str>,
  ) -> anyhow::Result<bool>;
  async fn accessible_environments(
    &self,
    user_id: &str,
  ) -> anyhow::Result<Vec<String>>;
}

pub async fn check(
  user_id: &str,
  resource: &str,
  action: &str,
  environment_id: Option<&str>,
) -> anyhow::Result<()> {
  let allowed = crate::state::authorizer()
    .allow(user_id, resource, action, environment_id)
    .await?;
  if allowed {
    Ok(())
  } else {
    Err(anyhow!(
      "user {user_id} does not have permission for {action} on {resource}"
    ))
  }
}

/// The hashing seam for agent token secrets. Verification must be
/// constant time in the implementation.
pub trait CredentialHasher: Send + Sync + 'static {
  fn hash(&self, secret: &str) -> anyhow::Result<String>;
  fn verify(&self, secret: &str, hash: &str) -> bool;
}
