//! Stack discovery: every container carrying the compose project
//! label belongs to a stack, whether or not this control plane
//! deployed it.

use std::collections::BTreeMap;

use anyhow::Context;
use bollard::models::{
  ContainerSummary, ContainerSummaryStateEnum,
};
use stevedore_client::entities::stack::{
  StackContainer, StackListItem, StackSource, aggregate_stack_state,
};

use crate::{router::daemon_client, state::store};

use super::external::COMPOSE_PROJECT_LABEL;

const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

pub async fn list_stacks(
  environment_id: &str,
) -> anyhow::Result<Vec<StackListItem>> {
  let daemon = daemon_client(environment_id).await?;
  let containers = daemon
    .list_containers()
    .await
    .context("Failed to list containers")?;

  // BTreeMap for stable name ordering in the result.
  let mut grouped: BTreeMap<String, Vec<StackContainer>> =
    BTreeMap::new();
  for container in containers {
    let Some(project) = container
      .labels
      .as_ref()
      .and_then(|labels| labels.get(COMPOSE_PROJECT_LABEL))
      .cloned()
    else {
      continue;
    };
    grouped
      .entry(project)
      .or_default()
      .push(to_stack_container(container));
  }

  let mut stacks = Vec::with_capacity(grouped.len());
  for (name, containers) in grouped {
    let running =
      containers.iter().filter(|c| c.running).count();
    let state = aggregate_stack_state(running, containers.len());
    let source = store()
      .stack_sources()
      .get(environment_id, &name)
      .await
      .context("Failed to query stack source")?
      .map(|record| record.source)
      .unwrap_or(StackSource::External);
    stacks.push(StackListItem {
      name,
      environment_id: environment_id.to_string(),
      state,
      source,
      containers,
    });
  }
  Ok(stacks)
}

fn to_stack_container(
  container: ContainerSummary,
) -> StackContainer {
  let name = container
    .names
    .as_ref()
    .and_then(|names| names.first())
    .map(|name| name.trim_start_matches('/').to_string())
    .unwrap_or_default();
  let service = container
    .labels
    .as_ref()
    .and_then(|labels| labels.get(COMPOSE_SERVICE_LABEL))
    .cloned();
  StackContainer {
    id: container.id.unwrap_or_default(),
    name,
    image: container.image,
    service,
    running: container.state
      == Some(ContainerSummaryStateEnum::RUNNING),
    status: container.status,
  }
}
