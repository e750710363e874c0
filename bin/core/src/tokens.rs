//! Agent token lifecycle. The secret is a 32 byte random value,
//! base64url encoded, shown to the operator exactly once. At rest
//! only an Argon2id hash plus an eight character identification
//! prefix survive.

use anyhow::{Context, anyhow};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use stevedore_client::entities::{
  environment::{AgentToken, Environment},
  stevedore_timestamp,
};

use crate::state::{credential_hasher, store};

const TOKEN_BYTES: usize = 32;
const PREFIX_LEN: usize = 8;

pub fn new_token_secret() -> String {
  let mut bytes = [0u8; TOKEN_BYTES];
  rand::rng().fill_bytes(&mut bytes);
  URL_SAFE_NO_PAD.encode(bytes)
}

/// Mint and persist a token for the environment, returning the plain
/// secret. It is not recoverable afterwards.
pub async fn generate_agent_token(
  environment_id: &str,
  expires_at: Option<i64>,
) -> anyhow::Result<String> {
  let secret = new_token_secret();
  let token_hash = credential_hasher()
    .hash(&secret)
    .context("Failed to hash agent token")?;
  let token = AgentToken {
    id: uuid::Uuid::new_v4().to_string(),
    environment_id: environment_id.to_string(),
    token_hash,
    prefix: secret[..PREFIX_LEN].to_string(),
    active: true,
    expires_at,
    last_used: None,
    created_at: stevedore_timestamp(),
  };
  store()
    .agent_tokens()
    .create(token)
    .await
    .context("Failed to persist agent token")?;
  Ok(secret)
}

/// Validate a presented secret against every active token.
/// Verification cost is constant time per candidate inside the
/// hasher; the prefix is for operator identification only and takes
/// no part in matching.
pub async fn validate_agent_token(
  secret: &str,
) -> anyhow::Result<Environment> {
  let now = stevedore_timestamp();
  let tokens = store()
    .agent_tokens()
    .list_active()
    .await
    .context("Failed to list agent tokens")?;
  for token in tokens {
    if token.expired(now) {
      continue;
    }
    if credential_hasher().verify(secret, &token.token_hash) {
      if let Err(e) =
        store().agent_tokens().set_last_used(&token.id, now).await
      {
        warn!(
          "failed to bump last_used on token {} | {e:#}",
          token.prefix
        );
      }
      return store()
        .environments()
        .get(&token.environment_id)
        .await
        .context("Failed to query environment for token")?
        .with_context(|| {
          format!(
            "token {} references missing environment {}",
            token.prefix, token.environment_id
          )
        });
    }
  }
  Err(anyhow!("invalid agent token"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn secrets_are_43_chars_of_base64url() {
    let secret = new_token_secret();
    // 32 bytes, no padding.
    assert_eq!(secret.len(), 43);
    assert!(secret.chars().all(|c| {
      c.is_ascii_alphanumeric() || c == '-' || c == '_'
    }));
  }

  #[test]
  fn secrets_are_unique() {
    assert_ne!(new_token_secret(), new_token_secret());
  }

  #[test]
  fn prefix_is_eight_chars() {
    let secret = new_token_secret();
    assert_eq!(secret[..PREFIX_LEN].len(), 8);
  }
}
