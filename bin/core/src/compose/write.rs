//! Compose file materialization for managed stacks. The canonical
//! location is `<data_dir>/stacks/<name>/docker-compose.yml`.

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};

use crate::config::core_config;

use super::{ensure_valid_name, stack_locks};

pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";

pub fn compose_file_path(name: &str) -> PathBuf {
  compose_file_path_in(&core_config().stacks_dir, name)
}

fn compose_file_path_in(root: &Path, name: &str) -> PathBuf {
  root.join(name).join(COMPOSE_FILE_NAME)
}

/// Write the compose file for a managed stack. `create` refuses to
/// overwrite an existing stack (cleaning any orphaned directory
/// first); update refuses to write a stack that was never created.
pub async fn save_compose_file(
  name: &str,
  contents: &str,
  create: bool,
) -> anyhow::Result<()> {
  ensure_valid_name(name)?;
  let lock = stack_locks().get_lock(name.to_string()).await;
  let _guard = lock.lock().await;
  save_compose_file_locked(name, contents, create).await
}

/// Variant for callers already holding the stack lock.
pub(crate) async fn save_compose_file_locked(
  name: &str,
  contents: &str,
  create: bool,
) -> anyhow::Result<()> {
  save_compose_file_in(&core_config().stacks_dir, name, contents, create)
    .await
}

async fn save_compose_file_in(
  root: &Path,
  name: &str,
  contents: &str,
  create: bool,
) -> anyhow::Result<()> {
  let file = compose_file_path_in(root, name);
  let dir = file
    .parent()
    .context("compose file path has no parent")?
    .to_path_buf();

  if create {
    if file.exists() {
      return Err(anyhow!(
        "stack {name} already exists at {file:?}"
      ));
    }
    // A directory without the file is an orphan from a failed
    // create; start clean.
    if dir.exists() {
      tokio::fs::remove_dir_all(&dir).await.with_context(|| {
        format!("Failed to clean orphaned stack dir {dir:?}")
      })?;
    }
  } else if !file.exists() {
    return Err(anyhow!(
      "stack {name} has no compose file to update at {file:?}"
    ));
  }

  tokio::fs::create_dir_all(&dir)
    .await
    .with_context(|| format!("Failed to create stack dir {dir:?}"))?;
  tokio::fs::write(&file, contents)
    .await
    .with_context(|| {
      format!("Failed to write compose file to {file:?}")
    })
}

pub async fn get_compose_file(name: &str) -> anyhow::Result<String> {
  ensure_valid_name(name)?;
  let file = compose_file_path(name);
  tokio::fs::read_to_string(&file).await.with_context(|| {
    format!("Failed to read compose file at {file:?}")
  })
}

/// Drop the stack's directory entirely.
pub(crate) async fn remove_compose_dir(
  name: &str,
) -> anyhow::Result<()> {
  let dir = core_config().stacks_dir.join(name);
  match tokio::fs::remove_dir_all(&dir).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e).with_context(|| {
      format!("Failed to remove stack dir {dir:?}")
    }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn create_then_read_round_trips() {
    let root = tempfile::tempdir().unwrap();
    save_compose_file_in(
      root.path(),
      "web",
      "services: {}\n",
      true,
    )
    .await
    .unwrap();
    let contents = tokio::fs::read_to_string(
      compose_file_path_in(root.path(), "web"),
    )
    .await
    .unwrap();
    assert_eq!(contents, "services: {}\n");
  }

  #[tokio::test]
  async fn create_refuses_to_overwrite() {
    let root = tempfile::tempdir().unwrap();
    save_compose_file_in(root.path(), "web", "v1", true)
      .await
      .unwrap();
    let err = save_compose_file_in(root.path(), "web", "v2", true)
      .await
      .unwrap_err();
    assert!(err.to_string().contains("already exists"));
  }

  #[tokio::test]
  async fn create_cleans_an_orphaned_directory() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("web");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("leftover.txt"), "junk")
      .await
      .unwrap();
    save_compose_file_in(root.path(), "web", "v1", true)
      .await
      .unwrap();
    assert!(!dir.join("leftover.txt").exists());
    assert!(compose_file_path_in(root.path(), "web").exists());
  }

  #[tokio::test]
  async fn update_requires_an_existing_file() {
    let root = tempfile::tempdir().unwrap();
    let err = save_compose_file_in(root.path(), "web", "v2", false)
      .await
      .unwrap_err();
    assert!(err.to_string().contains("no compose file"));

    save_compose_file_in(root.path(), "web", "v1", true)
      .await
      .unwrap();
    save_compose_file_in(root.path(), "web", "v2", false)
      .await
      .unwrap();
    let contents = tokio::fs::read_to_string(
      compose_file_path_in(root.path(), "web"),
    )
    .await
    .unwrap();
    assert_eq!(contents, "v2");
  }
}
