//! Vulnerability scanning via scanner containers run on the target
//! daemon, with a named cache volume for their databases.

use std::{sync::OnceLock, time::Duration};

use anyhow::{Context, anyhow};
use bollard::models::{ContainerCreateBody, HostConfig};
use dashmap::DashMap;
use serde_json::{Value, json};
use stevedore_client::entities::{
  environment::Environment,
  scan::{Scanner, SeverityCounts, VulnerabilityScan},
  stevedore_timestamp,
};
use uuid::Uuid;

use crate::{
  execution::ExecutionHandle,
  notify::{NotificationKind, notify_best_effort},
  router::DaemonClient,
  state::store,
  store::settings,
};

pub const HELPER_PREFIX: &str = "stevedore-helper-";

const SCAN_TIMEOUT: Duration = Duration::from_secs(600);
const SCAN_POLL: Duration = Duration::from_secs(2);
const HELPER_MAX_AGE_MS: i64 = 60 * 60 * 1000;

const DEFAULT_GRYPE_ARGS: &str = "docker:{image} -o json";
const DEFAULT_TRIVY_ARGS: &str = "image --format json {image}";

fn scanner_image(scanner: Scanner) -> &'static str {
  match scanner {
    Scanner::Grype => "anchore/grype:latest",
    Scanner::Trivy => "aquasec/trivy:latest",
  }
}

fn cache_volume(scanner: Scanner) -> String {
  format!("stevedore-scan-cache-{scanner}")
}

fn cache_mount_point(scanner: Scanner) -> &'static str {
  match scanner {
    Scanner::Grype => "/grype-db",
    Scanner::Trivy => "/root/.cache/trivy",
  }
}

/// Live scans per scanner kind; concurrent scans of the same
/// scanner get a private cache subdirectory so they don't fight
/// over database locks.
fn running_scans() -> &'static DashMap<Scanner, u32> {
  static RUNNING: OnceLock<DashMap<Scanner, u32>> =
    OnceLock::new();
  RUNNING.get_or_init(Default::default)
}

/// Run every configured scanner against the image reference,
/// persisting one scan row per scanner keyed by `image_id` and
/// merging counts by per-severity maximum.
pub async fn scan_image(
  daemon: &DaemonClient,
  environment: &Environment,
  image_reference: &str,
  image_id: &str,
  handle: &ExecutionHandle,
) -> anyhow::Result<SeverityCounts> {
  let scanners = environment.scanner.scanners();
  if scanners.is_empty() {
    return Err(anyhow!("no scanner configured"));
  }
  let mut merged = SeverityCounts::default();
  let mut succeeded = 0usize;
  let mut last_error = None;
  for scanner in scanners {
    handle
      .log(format!("scanning {image_reference} with {scanner}"))
      .await;
    match run_scanner(
      daemon,
      environment,
      *scanner,
      image_reference,
      image_id,
    )
    .await
    {
      Ok(counts) => {
        succeeded += 1;
        merged = merged.merge_max(&counts);
        handle
          .log(format!(
            "{scanner}: {} findings ({} critical, {} high)",
            counts.total(),
            counts.critical,
            counts.high
          ))
          .await;
      }
      Err(e) => {
        handle.log(format!("{scanner} failed: {e:#}")).await;
        warn!(
          "{scanner} scan of {image_reference} failed | {e:#}"
        );
        last_error = Some(e);
      }
    }
  }

  let require_all =
    settings::get_bool(settings::SCAN_REQUIRE_ALL, false).await;
  if succeeded == 0 || (require_all && succeeded < scanners.len())
  {
    return Err(
      last_error.unwrap_or_else(|| anyhow!("all scanners failed")),
    );
  }

  if let Some(highest) = merged.highest() {
    notify_best_effort(
      NotificationKind::VulnerabilitiesFound,
      json!({
        "image": image_reference,
        "highest_severity": highest,
        "counts": merged,
      }),
      Some(&environment.id),
    )
    .await;
  }
  Ok(merged)
}

async fn run_scanner(
  daemon: &DaemonClient,
  environment: &Environment,
  scanner: Scanner,
  image_reference: &str,
  image_id: &str,
) -> anyhow::Result<SeverityCounts> {
  let started = stevedore_timestamp();

  // Reserve a slot; anything above one concurrent scan isolates its
  // cache writes in a subdirectory.
  let concurrent = {
    let mut entry = running_scans().entry(scanner).or_insert(0);
    *entry += 1;
    *entry
  };
  let res = run_scanner_inner(
    daemon,
    scanner,
    image_reference,
    concurrent > 1,
  )
  .await;
  if let Some(mut entry) = running_scans().get_mut(&scanner) {
    *entry = entry.saturating_sub(1);
  }

  let duration_ms = stevedore_timestamp() - started;
  let (counts, vulnerabilities, error) = match &res {
    Ok((counts, raw)) => (*counts, raw.clone(), None),
    Err(e) => {
      (SeverityCounts::default(), Value::Null, Some(format!("{e:#}")))
    }
  };
  if let Err(e) = store()
    .scans()
    .insert(VulnerabilityScan {
      id: Uuid::new_v4().to_string(),
      environment_id: Some(environment.id.clone()),
      image_id: image_id.to_string(),
      image_name: image_reference.to_string(),
      scanner: scanner.to_string(),
      scanned_at: started,
      duration_ms,
      counts,
      vulnerabilities,
      error,
    })
    .await
  {
    warn!("failed to persist scan result | {e:#}");
  }

  res.map(|(counts, _)| counts)
}

async fn run_scanner_inner(
  daemon: &DaemonClient,
  scanner: Scanner,
  image_reference: &str,
  isolate_cache: bool,
) -> anyhow::Result<(SeverityCounts, Value)> {
  let args_template = match scanner {
    Scanner::Grype => {
      settings::get_string(
        settings::DEFAULT_GRYPE_ARGS,
        DEFAULT_GRYPE_ARGS,
      )
      .await
    }
    Scanner::Trivy => {
      settings::get_string(
        settings::DEFAULT_TRIVY_ARGS,
        DEFAULT_TRIVY_ARGS,
      )
      .await
    }
  };
  let cmd = args_template
    .replace("{image}", image_reference)
    .split_whitespace()
    .map(str::to_string)
    .collect::<Vec<_>>();

  let mut cache_dir = cache_mount_point(scanner).to_string();
  if isolate_cache {
    cache_dir = format!("{cache_dir}/{}", Uuid::new_v4());
  }
  let env = match scanner {
    Scanner::Grype => vec![
      format!("GRYPE_DB_CACHE_DIR={cache_dir}"),
      String::from("GRYPE_CHECK_FOR_APP_UPDATE=false"),
    ],
    Scanner::Trivy => vec![format!("TRIVY_CACHE_DIR={cache_dir}")],
  };

  daemon.pull_image(scanner_image(scanner)).await.ok();

  let name = format!(
    "{HELPER_PREFIX}scan-{scanner}-{}",
    &Uuid::new_v4().to_string()[..8]
  );
  let created = daemon
    .create_container(
      &name,
      ContainerCreateBody {
        image: Some(scanner_image(scanner).to_string()),
        cmd: Some(cmd),
        env: Some(env),
        host_config: Some(HostConfig {
          binds: Some(vec![
            String::from(
              "/var/run/docker.sock:/var/run/docker.sock",
            ),
            format!(
              "{}:{}",
              cache_volume(scanner),
              cache_mount_point(scanner)
            ),
          ]),
          auto_remove: Some(false),
          ..Default::default()
        }),
        ..Default::default()
      },
    )
    .await
    .context("Failed to create scanner container")?;
  let container_id = created.id;

  let scan = async {
    daemon
      .start_container(&container_id)
      .await
      .context("Failed to start scanner container")?;
    let deadline = stevedore_timestamp()
      + SCAN_TIMEOUT.as_millis() as i64;
    loop {
      tokio::time::sleep(SCAN_POLL).await;
      let inspect = daemon
        .inspect_container(&container_id)
        .await
        .context("Failed to poll scanner container")?;
      let running = inspect
        .state
        .as_ref()
        .and_then(|state| state.running)
        .unwrap_or(false);
      if !running {
        let exit_code = inspect
          .state
          .as_ref()
          .and_then(|state| state.exit_code)
          .unwrap_or(-1);
        if exit_code != 0 {
          let tail =
            daemon.container_logs(&container_id, 20).await;
          return Err(anyhow!(
            "{scanner} exited with code {exit_code}: {}",
            tail.unwrap_or_default().trim()
          ));
        }
        break;
      }
      if stevedore_timestamp() > deadline {
        return Err(anyhow!(
          "{scanner} scan exceeded {}s",
          SCAN_TIMEOUT.as_secs()
        ));
      }
    }
    let output = daemon
      .container_logs(&container_id, 100_000)
      .await
      .context("Failed to read scanner output")?;
    parse_scanner_output(scanner, &output)
  }
  .await;

  // The helper is removed on every path; a crashed removal is
  // covered by the periodic helper cleanup.
  if let Err(e) = daemon.remove_container(&container_id, true).await
  {
    warn!("failed to remove scanner container {name} | {e}");
  }

  scan
}

fn parse_scanner_output(
  scanner: Scanner,
  output: &str,
) -> anyhow::Result<(SeverityCounts, Value)> {
  // Scanner output can be preceded by progress noise; find the
  // first JSON object.
  let start = output
    .find('{')
    .with_context(|| format!("no json in {scanner} output"))?;
  let value: Value = serde_json::from_str(output[start..].trim())
    .with_context(|| format!("invalid {scanner} json output"))?;
  let counts = match scanner {
    Scanner::Grype => grype_counts(&value),
    Scanner::Trivy => trivy_counts(&value),
  };
  Ok((counts, value))
}

fn bump(counts: &mut SeverityCounts, severity: &str) {
  match severity.to_ascii_lowercase().as_str() {
    "critical" => counts.critical += 1,
    "high" => counts.high += 1,
    "medium" => counts.medium += 1,
    "low" => counts.low += 1,
    "negligible" => counts.negligible += 1,
    _ => counts.unknown += 1,
  }
}

fn grype_counts(value: &Value) -> SeverityCounts {
  let mut counts = SeverityCounts::default();
  for m in value
    .get("matches")
    .and_then(Value::as_array)
    .into_iter()
    .flatten()
  {
    if let Some(severity) = m
      .pointer("/vulnerability/severity")
      .and_then(Value::as_str)
    {
      bump(&mut counts, severity);
    }
  }
  counts
}

fn trivy_counts(value: &Value) -> SeverityCounts {
  let mut counts = SeverityCounts::default();
  for result in value
    .get("Results")
    .and_then(Value::as_array)
    .into_iter()
    .flatten()
  {
    for vulnerability in result
      .get("Vulnerabilities")
      .and_then(Value::as_array)
      .into_iter()
      .flatten()
    {
      if let Some(severity) = vulnerability
        .get("Severity")
        .and_then(Value::as_str)
      {
        bump(&mut counts, severity);
      }
    }
  }
  counts
}

/// Remove helper containers (scan runners, volume helpers) that
/// outlived their hour, across every environment.
pub async fn cleanup_helper_containers(
  handle: &ExecutionHandle,
) -> anyhow::Result<Value> {
  let environments = store()
    .environments()
    .list()
    .await
    .context("Failed to list environments")?;
  let cutoff =
    (stevedore_timestamp() - HELPER_MAX_AGE_MS) / 1000;
  let mut removed = 0u64;
  for environment in environments {
    let daemon =
      match crate::router::daemon_client(&environment.id).await {
        Ok(daemon) => daemon,
        Err(e) => {
          debug!(
            "skipping helper cleanup for {} | {e:#}",
            environment.name
          );
          continue;
        }
      };
    let containers = match daemon.list_containers().await {
      Ok(containers) => containers,
      Err(e) => {
        debug!(
          "failed to list containers on {} | {e}",
          environment.name
        );
        continue;
      }
    };
    for container in containers {
      let name = container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default();
      if !name.starts_with(HELPER_PREFIX) {
        continue;
      }
      if container.created.unwrap_or(i64::MAX) > cutoff {
        continue;
      }
      let id = container.id.unwrap_or_default();
      match daemon.remove_container(&id, true).await {
        Ok(()) => {
          removed += 1;
          handle
            .log(format!(
              "removed stale helper {name} on {}",
              environment.name
            ))
            .await;
        }
        Err(e) => {
          warn!("failed to remove helper {name} | {e}");
        }
      }
    }
  }
  Ok(json!({ "removed": removed }))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn grype_output_counts_by_severity() {
    let raw = json!({
      "matches": [
        { "vulnerability": { "severity": "Critical" } },
        { "vulnerability": { "severity": "Critical" } },
        { "vulnerability": { "severity": "High" } },
        { "vulnerability": { "severity": "Negligible" } },
        { "vulnerability": { "severity": "Whatever" } },
      ]
    });
    let counts = grype_counts(&raw);
    assert_eq!(counts.critical, 2);
    assert_eq!(counts.high, 1);
    assert_eq!(counts.negligible, 1);
    assert_eq!(counts.unknown, 1);
    assert_eq!(counts.total(), 5);
  }

  #[test]
  fn trivy_output_counts_across_results() {
    let raw = json!({
      "Results": [
        { "Vulnerabilities": [
          { "Severity": "HIGH" },
          { "Severity": "LOW" },
        ]},
        { "Vulnerabilities": [
          { "Severity": "MEDIUM" },
        ]},
        {},
      ]
    });
    let counts = trivy_counts(&raw);
    assert_eq!(counts.high, 1);
    assert_eq!(counts.medium, 1);
    assert_eq!(counts.low, 1);
    assert_eq!(counts.total(), 3);
  }

  #[test]
  fn scanner_output_skips_progress_noise() {
    let output = format!(
      "pulling db...\ndone\n{}",
      json!({ "matches": [
        { "vulnerability": { "severity": "High" } }
      ]})
    );
    let (counts, _) =
      parse_scanner_output(Scanner::Grype, &output).unwrap();
    assert_eq!(counts.high, 1);
  }

  #[test]
  fn non_json_output_is_an_error() {
    assert!(
      parse_scanner_output(Scanner::Trivy, "total garbage")
        .is_err()
    );
  }
}
