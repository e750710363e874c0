//! Per-environment metrics collection: container stats every 10s,
//! a host disk audit every 5 minutes.

use std::{sync::OnceLock, time::Duration};

use anyhow::Context;
use bollard::models::ContainerStatsResponse;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::json;
use stevedore_client::entities::{
  environment::Environment, event::HostMetric, stevedore_timestamp,
};
use tokio_util::sync::CancellationToken;

use crate::{
  notify::{NotificationKind, notify_best_effort},
  router,
  state::store,
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);
const DISK_INTERVAL: Duration = Duration::from_secs(300);
const STATS_TIMEOUT: Duration = Duration::from_secs(15);
const DISK_TIMEOUT: Duration = Duration::from_secs(20);

const DEFAULT_DISK_THRESHOLD: f64 = 80.0;
const DISK_WARNING_COOLDOWN_MS: i64 = 60 * 60 * 1000;

/// Per-environment timestamp of the last disk warning. Survives
/// worker restarts.
fn disk_warning_sent() -> &'static DashMap<String, i64> {
  static SENT: OnceLock<DashMap<String, i64>> = OnceLock::new();
  SENT.get_or_init(Default::default)
}

pub async fn run_metrics_worker(
  environment: Environment,
  cancel: CancellationToken,
) {
  let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
  let mut disk_tick = tokio::time::interval(DISK_INTERVAL);
  stats_tick.set_missed_tick_behavior(
    tokio::time::MissedTickBehavior::Delay,
  );
  disk_tick.set_missed_tick_behavior(
    tokio::time::MissedTickBehavior::Delay,
  );
  loop {
    tokio::select! {
      _ = stats_tick.tick() => {
        let res = tokio::time::timeout(
          STATS_TIMEOUT,
          collect_stats(&environment),
        )
        .await;
        match res {
          Ok(Err(e)) => debug!(
            "stats collection failed for {} | {e:#}",
            environment.name
          ),
          Err(_) => debug!(
            "stats collection timed out for {}",
            environment.name
          ),
          Ok(Ok(())) => {}
        }
      }
      _ = disk_tick.tick() => {
        let res = tokio::time::timeout(
          DISK_TIMEOUT,
          audit_disk(&environment),
        )
        .await;
        match res {
          Ok(Err(e)) => debug!(
            "disk audit failed for {} | {e:#}",
            environment.name
          ),
          Err(_) => debug!(
            "disk audit timed out for {}",
            environment.name
          ),
          Ok(Ok(())) => {}
        }
      }
      _ = cancel.cancelled() => return,
    }
  }
}

async fn collect_stats(
  environment: &Environment,
) -> anyhow::Result<()> {
  let daemon = router::daemon_client(&environment.id).await?;
  let containers = daemon
    .list_containers()
    .await
    .context("Failed to list containers")?;
  let running = containers
    .into_iter()
    .filter(|c| {
      c.state
        == Some(bollard::models::ContainerSummaryStateEnum::RUNNING)
    })
    .filter_map(|c| c.id)
    .collect::<Vec<_>>();
  if running.is_empty() {
    return Ok(());
  }

  // One slow container must not starve the rest of the sample.
  let samples = join_all(running.iter().map(|id| {
    let daemon = daemon.clone();
    async move { daemon.container_stats_once(id).await }
  }))
  .await;

  let mut cpu_total = 0f64;
  let mut memory_used = 0u64;
  let mut memory_total = 0u64;
  let mut cores = 0u64;
  for sample in samples.into_iter().flatten() {
    let (cpu, sample_cores) = container_cpu_percent(&sample);
    cpu_total += cpu;
    cores = cores.max(sample_cores);
    memory_used += container_memory_used(&sample);
    if let Some(limit) =
      sample.memory_stats.as_ref().and_then(|m| m.limit)
    {
      memory_total = memory_total.max(limit);
    }
  }

  if cores == 0 {
    let info =
      daemon.info().await.context("Failed to read daemon info")?;
    cores = info.ncpu.unwrap_or_default() as u64;
  }
  if cores == 0 || memory_total == 0 {
    return Ok(());
  }

  let cpu_percent = cpu_total / cores as f64;
  let memory_percent =
    memory_used as f64 / memory_total as f64 * 100.0;
  if !cpu_percent.is_finite()
    || cpu_percent < 0.0
    || !memory_percent.is_finite()
    || memory_percent < 0.0
  {
    return Ok(());
  }

  store()
    .host_metrics()
    .insert(HostMetric {
      environment_id: environment.id.clone(),
      cpu_percent,
      memory_percent,
      memory_used,
      memory_total,
      timestamp: stevedore_timestamp(),
    })
    .await
    .context("Failed to persist host metric")
}

/// Per-container cpu percent from the delta sample, plus the core
/// count the daemon reported.
fn container_cpu_percent(
  stats: &ContainerStatsResponse,
) -> (f64, u64) {
  let Some(cpu) = &stats.cpu_stats else {
    return (0.0, 0);
  };
  let Some(precpu) = &stats.precpu_stats else {
    return (0.0, 0);
  };
  let cores = cpu.online_cpus.unwrap_or_default() as u64;
  let cpu_delta = cpu
    .cpu_usage
    .as_ref()
    .and_then(|u| u.total_usage)
    .unwrap_or_default()
    .saturating_sub(
      precpu
        .cpu_usage
        .as_ref()
        .and_then(|u| u.total_usage)
        .unwrap_or_default(),
    );
  let system_delta = cpu
    .system_cpu_usage
    .unwrap_or_default()
    .saturating_sub(precpu.system_cpu_usage.unwrap_or_default());
  if system_delta == 0 || cores == 0 {
    return (0.0, cores);
  }
  (
    cpu_delta as f64 / system_delta as f64 * cores as f64 * 100.0,
    cores,
  )
}

/// Usage minus page cache, when the cache counter is available.
fn container_memory_used(stats: &ContainerStatsResponse) -> u64 {
  let Some(memory) = &stats.memory_stats else {
    return 0;
  };
  let usage = memory.usage.unwrap_or_default();
  let cache = memory
    .stats
    .as_ref()
    .and_then(|s| s.get("cache"))
    .copied()
    .unwrap_or_default();
  usage.saturating_sub(cache)
}

async fn audit_disk(
  environment: &Environment,
) -> anyhow::Result<()> {
  let daemon = router::daemon_client(&environment.id).await?;
  let usage = daemon
    .disk_usage()
    .await
    .context("Failed to read disk usage")?;

  let mut used = 0u64;
  for image in usage.images.unwrap_or_default() {
    used += image.size.max(0) as u64;
  }
  for container in usage.containers.unwrap_or_default() {
    used += container.size_rw.unwrap_or_default().max(0) as u64;
  }
  for volume in usage.volumes.unwrap_or_default() {
    if let Some(data) = volume.usage_data {
      used += data.size.max(0) as u64;
    }
  }
  for cache_entry in usage.build_cache.unwrap_or_default() {
    used += cache_entry.size.unwrap_or_default().max(0) as u64;
  }

  let info =
    daemon.info().await.context("Failed to read daemon info")?;
  let total = info
    .driver_status
    .unwrap_or_default()
    .into_iter()
    .find(|pair| {
      pair.first().map(String::as_str) == Some("Data Space Total")
    })
    .and_then(|pair| pair.get(1).cloned())
    .and_then(|raw| parse_human_size(&raw));

  let Some(total) = total else {
    // Driver does not report pool totals; nothing to threshold
    // against.
    return Ok(());
  };
  if total == 0 {
    return Ok(());
  }

  let percent = used as f64 / total as f64 * 100.0;
  let threshold = environment
    .disk_warning_threshold
    .unwrap_or(DEFAULT_DISK_THRESHOLD);
  if percent < threshold {
    return Ok(());
  }

  let now = stevedore_timestamp();
  let recently_warned = disk_warning_sent()
    .get(&environment.id)
    .map(|last| now - *last < DISK_WARNING_COOLDOWN_MS)
    .unwrap_or(false);
  if recently_warned {
    return Ok(());
  }
  disk_warning_sent().insert(environment.id.clone(), now);

  warn!(
    "disk usage on {} at {percent:.1}% (threshold {threshold}%)",
    environment.name
  );
  notify_best_effort(
    NotificationKind::DiskWarning,
    json!({
      "environment": environment.name,
      "used": used,
      "total": total,
      "percent": percent,
    }),
    Some(&environment.id),
  )
  .await;
  Ok(())
}

/// Parses sizes like "107.4 GB" / "2.5 TB" as reported in driver
/// status pairs.
fn parse_human_size(raw: &str) -> Option<u64> {
  let raw = raw.trim();
  let split = raw
    .find(|c: char| c.is_ascii_alphabetic())
    .unwrap_or(raw.len());
  let value: f64 = raw[..split].trim().parse().ok()?;
  let unit = raw[split..].trim().to_ascii_uppercase();
  let factor: f64 = match unit.as_str() {
    "B" | "" => 1.0,
    "KB" | "KIB" => 1024.0,
    "MB" | "MIB" => 1024.0 * 1024.0,
    "GB" | "GIB" => 1024.0 * 1024.0 * 1024.0,
    "TB" | "TIB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
    _ => return None,
  };
  Some((value * factor) as u64)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_driver_status_sizes() {
    assert_eq!(parse_human_size("1 KB"), Some(1024));
    assert_eq!(
      parse_human_size("107.4 GB"),
      Some((107.4 * 1024.0 * 1024.0 * 1024.0) as u64)
    );
    assert_eq!(parse_human_size("512B"), Some(512));
    assert_eq!(parse_human_size("12"), Some(12));
    assert_eq!(parse_human_size("nonsense"), None);
  }

  fn stats_with(
    total: u64,
    pre_total: u64,
    system: u64,
    pre_system: u64,
    cores: u32,
  ) -> ContainerStatsResponse {
    ContainerStatsResponse {
      cpu_stats: Some(bollard::models::ContainerCpuStats {
        cpu_usage: Some(bollard::models::ContainerCpuUsage {
          total_usage: Some(total),
          ..Default::default()
        }),
        system_cpu_usage: Some(system),
        online_cpus: Some(cores),
        ..Default::default()
      }),
      precpu_stats: Some(bollard::models::ContainerCpuStats {
        cpu_usage: Some(bollard::models::ContainerCpuUsage {
          total_usage: Some(pre_total),
          ..Default::default()
        }),
        system_cpu_usage: Some(pre_system),
        ..Default::default()
      }),
      ..Default::default()
    }
  }

  #[test]
  fn cpu_percent_from_deltas() {
    // 10% of system delta across 4 cores -> 40%.
    let stats = stats_with(1_100, 100, 11_000, 1_000, 4);
    let (cpu, cores) = container_cpu_percent(&stats);
    assert_eq!(cores, 4);
    assert!((cpu - 40.0).abs() < 0.01, "{cpu}");
  }

  #[test]
  fn cpu_percent_zero_when_no_system_delta() {
    let stats = stats_with(500, 100, 1_000, 1_000, 4);
    assert_eq!(container_cpu_percent(&stats).0, 0.0);
  }

  #[test]
  fn memory_subtracts_cache() {
    let stats = ContainerStatsResponse {
      memory_stats: Some(bollard::models::ContainerMemoryStats {
        usage: Some(1_000_000),
        stats: Some(std::collections::HashMap::from([(
          String::from("cache"),
          300_000u64,
        )])),
        ..Default::default()
      }),
      ..Default::default()
    };
    assert_eq!(container_memory_used(&stats), 700_000);
  }
}
