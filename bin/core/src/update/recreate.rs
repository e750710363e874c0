//! Container recreation preserving the runtime configuration the
//! operator cares about: env, cmd, labels, port bindings, binds,
//! restart policy, network mode.

use anyhow::{Context, anyhow};
use bollard::models::{
  ContainerCreateBody, ContainerInspectResponse, HostConfig,
};

use crate::{execution::ExecutionHandle, router::DaemonClient};

pub struct RecreatedContainer {
  pub id: String,
  pub name: String,
  pub started: bool,
}

/// Stop (if running), force remove, recreate on the given image and
/// start again iff it was running before.
pub async fn recreate_container(
  daemon: &DaemonClient,
  inspect: ContainerInspectResponse,
  image: &str,
  handle: &ExecutionHandle,
) -> anyhow::Result<RecreatedContainer> {
  let old_id = inspect
    .id
    .clone()
    .context("container inspect has no id")?;
  let name = inspect
    .name
    .clone()
    .map(|name| name.trim_start_matches('/').to_string())
    .filter(|name| !name.is_empty())
    .context("container inspect has no name")?;
  let was_running = inspect
    .state
    .as_ref()
    .and_then(|state| state.running)
    .unwrap_or(false);

  let body = create_body_from_inspect(&inspect, image)?;

  if was_running {
    handle.log(format!("stopping {name}")).await;
    daemon
      .stop_container(&old_id, Some(10))
      .await
      .context("Failed to stop container")?;
  }
  daemon
    .remove_container(&old_id, true)
    .await
    .context("Failed to remove container")?;
  handle.log(format!("recreating {name} on {image}")).await;
  let created = daemon
    .create_container(&name, body)
    .await
    .context("Failed to recreate container")?;
  if was_running {
    daemon
      .start_container(&created.id)
      .await
      .context("Failed to start recreated container")?;
  }
  Ok(RecreatedContainer {
    id: created.id,
    name,
    started: was_running,
  })
}

fn create_body_from_inspect(
  inspect: &ContainerInspectResponse,
  image: &str,
) -> anyhow::Result<ContainerCreateBody> {
  let config = inspect
    .config
    .clone()
    .ok_or_else(|| anyhow!("container inspect has no config"))?;
  let host_config = inspect.host_config.clone().unwrap_or_default();
  Ok(ContainerCreateBody {
    image: Some(image.to_string()),
    env: config.env,
    cmd: config.cmd,
    entrypoint: config.entrypoint,
    labels: config.labels,
    exposed_ports: config.exposed_ports,
    working_dir: config.working_dir,
    user: config.user,
    host_config: Some(HostConfig {
      binds: host_config.binds,
      port_bindings: host_config.port_bindings,
      restart_policy: host_config.restart_policy,
      network_mode: host_config.network_mode,
      extra_hosts: host_config.extra_hosts,
      privileged: host_config.privileged,
      cap_add: host_config.cap_add,
      cap_drop: host_config.cap_drop,
      mounts: host_config.mounts,
      ..Default::default()
    }),
    ..Default::default()
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use bollard::models::{ContainerConfig, ContainerState};

  fn inspect_fixture() -> ContainerInspectResponse {
    ContainerInspectResponse {
      id: Some(String::from("abc123")),
      name: Some(String::from("/web")),
      state: Some(ContainerState {
        running: Some(true),
        ..Default::default()
      }),
      config: Some(ContainerConfig {
        image: Some(String::from("nginx:1.24")),
        env: Some(vec![String::from("FOO=1")]),
        cmd: Some(vec![String::from("nginx")]),
        labels: Some(std::collections::HashMap::from([(
          String::from("com.docker.compose.project"),
          String::from("web"),
        )])),
        ..Default::default()
      }),
      host_config: Some(HostConfig {
        network_mode: Some(String::from("bridge")),
        binds: Some(vec![String::from("/data:/data")]),
        ..Default::default()
      }),
      ..Default::default()
    }
  }

  #[test]
  fn body_preserves_runtime_config_with_the_new_image() {
    let body =
      create_body_from_inspect(&inspect_fixture(), "nginx:1.25")
        .unwrap();
    assert_eq!(body.image.as_deref(), Some("nginx:1.25"));
    assert_eq!(
      body.env.as_deref(),
      Some(&[String::from("FOO=1")][..])
    );
    assert_eq!(
      body.cmd.as_deref(),
      Some(&[String::from("nginx")][..])
    );
    let host = body.host_config.unwrap();
    assert_eq!(host.network_mode.as_deref(), Some("bridge"));
    assert_eq!(
      host.binds.as_deref(),
      Some(&[String::from("/data:/data")][..])
    );
    assert!(
      body
        .labels
        .unwrap()
        .contains_key("com.docker.compose.project")
    );
  }

  #[test]
  fn missing_config_is_an_error() {
    let inspect = ContainerInspectResponse::default();
    assert!(
      create_body_from_inspect(&inspect, "nginx:1.25").is_err()
    );
  }
}
