//! The safe-pull flow: pull the new content under a temp tag, scan
//! it, and only let the real tag point at it once the criteria
//! pass. A block or scan failure leaves the container untouched and
//! the original tag resolving to the known-safe image.

use anyhow::{Context, anyhow};
use serde_json::json;
use stevedore_client::entities::{
  environment::Environment,
  scan::{ScanCriteria, SeverityCounts},
};

use crate::{
  execution::ExecutionHandle,
  notify::{NotificationKind, notify_best_effort},
  registry::split_image_reference,
  router::DaemonClient,
  state::store,
};

use super::scan::scan_image;

const PENDING_SUFFIX: &str = "-pending";

/// `<repo>:<tag>-pending`, repo keeping any `registry:port/` prefix.
pub fn temp_tag(reference: &str) -> (String, String, String) {
  let parsed = split_image_reference(reference);
  let repo = parsed.name;
  let pending = format!("{}{PENDING_SUFFIX}", parsed.tag);
  (repo.clone(), pending.clone(), format!("{repo}:{pending}"))
}

#[derive(Debug)]
pub enum SafePullOutcome {
  Approved { new_image_id: String },
  Blocked { counts: SeverityCounts },
  /// The pull produced the image already running.
  AlreadyCurrent,
}

pub async fn safe_pull(
  daemon: &DaemonClient,
  environment: &Environment,
  reference: &str,
  old_image_id: &str,
  handle: &ExecutionHandle,
) -> anyhow::Result<SafePullOutcome> {
  let parsed = split_image_reference(reference);
  if parsed.digest.is_some() {
    return Err(anyhow!(
      "safe pull only applies to tag references"
    ));
  }
  let (repo, pending_tag, temp_ref) = temp_tag(reference);
  let tag = parsed.tag;

  // The pull moves the original tag to the new content.
  handle.log(format!("pulling {reference}")).await;
  daemon
    .pull_image(reference)
    .await
    .context("Failed to pull image")?;
  let new_image_id = daemon
    .inspect_image(reference)
    .await
    .context("Failed to inspect pulled image")?
    .id
    .context("pulled image has no id")?;

  if new_image_id == old_image_id {
    return Ok(SafePullOutcome::AlreadyCurrent);
  }

  // Point the original tag back at the running image so its lineage
  // stays resolvable, and park the new content on the temp tag.
  daemon
    .tag_image(old_image_id, &repo, &tag)
    .await
    .context("Failed to restore original tag")?;
  daemon
    .tag_image(&new_image_id, &repo, &pending_tag)
    .await
    .context("Failed to apply temp tag")?;
  handle
    .log(format!("holding new image as {temp_ref}"))
    .await;

  let decision = scan_and_decide(
    daemon,
    environment,
    &temp_ref,
    &new_image_id,
    old_image_id,
    handle,
  )
  .await;

  match decision {
    Ok(ScanDecision::Approve(counts)) => {
      daemon
        .tag_image(&new_image_id, &repo, &tag)
        .await
        .context("Failed to promote approved image")?;
      remove_best_effort(daemon, &temp_ref, false).await;
      handle
        .log(format!(
          "approved: {} findings within policy",
          counts.total()
        ))
        .await;
      Ok(SafePullOutcome::Approved { new_image_id })
    }
    Ok(ScanDecision::Block(counts)) => {
      remove_best_effort(daemon, &temp_ref, false).await;
      remove_best_effort(daemon, &new_image_id, true).await;
      notify_best_effort(
        NotificationKind::AutoUpdateBlocked,
        json!({
          "environment": environment.name,
          "image": reference,
          "counts": counts,
          "criteria": environment.scan_criteria,
        }),
        Some(&environment.id),
      )
      .await;
      handle
        .log(format!(
          "blocked by {} criteria ({} critical, {} high, total {})",
          environment.scan_criteria,
          counts.critical,
          counts.high,
          counts.total()
        ))
        .await;
      Ok(SafePullOutcome::Blocked { counts })
    }
    Err(e) => {
      // Scan failure fails the update; the temp image must not
      // linger.
      remove_best_effort(daemon, &temp_ref, false).await;
      remove_best_effort(daemon, &new_image_id, true).await;
      Err(e.context("Scan of pulled image failed"))
    }
  }
}

enum ScanDecision {
  Approve(SeverityCounts),
  Block(SeverityCounts),
}

async fn scan_and_decide(
  daemon: &DaemonClient,
  environment: &Environment,
  temp_ref: &str,
  new_image_id: &str,
  old_image_id: &str,
  handle: &ExecutionHandle,
) -> anyhow::Result<ScanDecision> {
  let counts =
    scan_image(daemon, environment, temp_ref, new_image_id, handle)
      .await?;
  let current_total = current_total_for(
    daemon,
    environment,
    old_image_id,
    handle,
  )
  .await;
  let blocked = environment
    .scan_criteria
    .blocks(&counts, current_total);
  Ok(if blocked {
    ScanDecision::Block(counts)
  } else {
    ScanDecision::Approve(counts)
  })
}

/// Finding total of the currently running image, for the
/// more-than-current criteria. Scans it on cache miss.
async fn current_total_for(
  daemon: &DaemonClient,
  environment: &Environment,
  old_image_id: &str,
  handle: &ExecutionHandle,
) -> Option<u64> {
  if environment.scan_criteria != ScanCriteria::MoreThanCurrent {
    return None;
  }
  match store()
    .scans()
    .latest_for_image(&environment.id, old_image_id)
    .await
  {
    Ok(Some(scan)) => return Some(scan.counts.total()),
    Ok(None) => {}
    Err(e) => {
      warn!("failed to look up cached scan | {e:#}");
      return None;
    }
  }
  handle
    .log("no cached scan of the running image, scanning it first")
    .await;
  match scan_image(
    daemon,
    environment,
    old_image_id,
    old_image_id,
    handle,
  )
  .await
  {
    Ok(counts) => Some(counts.total()),
    Err(e) => {
      warn!("failed to scan current image | {e:#}");
      None
    }
  }
}

async fn remove_best_effort(
  daemon: &DaemonClient,
  image: &str,
  force: bool,
) {
  if let Err(e) = daemon.remove_image(image, force).await {
    debug!("image removal of {image} failed | {e}");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn temp_tag_appends_pending_to_the_tag() {
    let (repo, pending, full) = temp_tag("nginx:1.25");
    assert_eq!(repo, "nginx");
    assert_eq!(pending, "1.25-pending");
    assert_eq!(full, "nginx:1.25-pending");
  }

  #[test]
  fn temp_tag_defaults_to_latest() {
    let (_, pending, full) = temp_tag("nginx");
    assert_eq!(pending, "latest-pending");
    assert_eq!(full, "nginx:latest-pending");
  }

  #[test]
  fn temp_tag_keeps_registry_port() {
    let (repo, _, full) = temp_tag("registry:5000/ns/app:v3");
    assert_eq!(repo, "registry:5000/ns/app");
    assert_eq!(full, "registry:5000/ns/app:v3-pending");
  }
}
