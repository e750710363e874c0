//! Default implementations of the collaborator seams: an in-memory
//! store, a log-only notifier, an allow-all authorizer and an
//! Argon2id hasher. Embedders replace these at
//! [crate::state::init_services]; they also back the standalone
//! binary and the test suite.

use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use stevedore_client::entities::{
  environment::{AgentInfo, AgentToken, Environment},
  event::{ContainerEvent, HostMetric},
  git::{GitCredential, GitStack},
  scan::VulnerabilityScan,
  schedule::{ExecutionStatus, Schedule, ScheduleExecution},
  stack::{StackEnvVar, StackSourceRecord},
  update::PendingContainerUpdate,
};

use crate::{
  notify::{NotificationKind, Notifier},
  permission::{Authorizer, CredentialHasher},
  store::*,
};

/// Everything in maps; suits a single node and the tests.
#[derive(Default)]
pub struct MemoryStore {
  environments: DashMap<String, Environment>,
  agent_tokens: DashMap<String, AgentToken>,
  stack_sources: DashMap<(String, String), StackSourceRecord>,
  stack_env_vars: RwLock<Vec<StackEnvVar>>,
  schedules: DashMap<String, Schedule>,
  executions: DashMap<String, ScheduleExecution>,
  container_events: RwLock<Vec<ContainerEvent>>,
  host_metrics: RwLock<Vec<HostMetric>>,
  scans: RwLock<Vec<VulnerabilityScan>>,
  pending_updates: DashMap<(String, String), PendingContainerUpdate>,
  git_stacks: DashMap<String, GitStack>,
  git_credentials: DashMap<String, GitCredential>,
  settings: DashMap<String, String>,
}

impl MemoryStore {
  pub fn insert_environment(&self, environment: Environment) {
    self
      .environments
      .insert(environment.id.clone(), environment);
  }

  pub fn insert_schedule(&self, schedule: Schedule) {
    self.schedules.insert(schedule.id.clone(), schedule);
  }

  pub fn insert_git_stack(&self, git_stack: GitStack) {
    self.git_stacks.insert(git_stack.id.clone(), git_stack);
  }

  pub fn set_setting(&self, key: &str, value: &str) {
    self
      .settings
      .insert(key.to_string(), value.to_string());
  }
}

impl Store for MemoryStore {
  fn environments(&self) -> &dyn EnvironmentRepo {
    self
  }
  fn agent_tokens(&self) -> &dyn AgentTokenRepo {
    self
  }
  fn stack_sources(&self) -> &dyn StackSourceRepo {
    self
  }
  fn stack_env_vars(&self) -> &dyn StackEnvVarRepo {
    self
  }
  fn schedules(&self) -> &dyn ScheduleRepo {
    self
  }
  fn executions(&self) -> &dyn ExecutionRepo {
    self
  }
  fn container_events(&self) -> &dyn ContainerEventRepo {
    self
  }
  fn host_metrics(&self) -> &dyn HostMetricRepo {
    self
  }
  fn scans(&self) -> &dyn ScanRepo {
    self
  }
  fn pending_updates(&self) -> &dyn PendingUpdateRepo {
    self
  }
  fn git_stacks(&self) -> &dyn GitStackRepo {
    self
  }
  fn settings(&self) -> &dyn SettingsRepo {
    self
  }
}

#[async_trait]
impl EnvironmentRepo for MemoryStore {
  async fn list(&self) -> anyhow::Result<Vec<Environment>> {
    Ok(
      self
        .environments
        .iter()
        .map(|entry| entry.value().clone())
        .collect(),
    )
  }
  async fn get(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<Environment>> {
    Ok(self.environments.get(id).map(|entry| entry.clone()))
  }
  async fn update_agent_info(
    &self,
    id: &str,
    info: AgentInfo,
  ) -> anyhow::Result<()> {
    if let Some(mut environment) = self.environments.get_mut(id) {
      environment.agent = Some(info);
    }
    Ok(())
  }
}

#[async_trait]
impl AgentTokenRepo for MemoryStore {
  async fn list_active(&self) -> anyhow::Result<Vec<AgentToken>> {
    Ok(
      self
        .agent_tokens
        .iter()
        .filter(|entry| entry.active)
        .map(|entry| entry.value().clone())
        .collect(),
    )
  }
  async fn create(&self, token: AgentToken) -> anyhow::Result<()> {
    self.agent_tokens.insert(token.id.clone(), token);
    Ok(())
  }
  async fn set_last_used(
    &self,
    id: &str,
    ts: i64,
  ) -> anyhow::Result<()> {
    if let Some(mut token) = self.agent_tokens.get_mut(id) {
      token.last_used = Some(ts);
    }
    Ok(())
  }
}

#[async_trait]
impl StackSourceRepo for MemoryStore {
  async fn get(
    &self,
    environment_id: &str,
    stack_name: &str,
  ) -> anyhow::Result<Option<StackSourceRecord>> {
    Ok(
      self
        .stack_sources
        .get(&(
          environment_id.to_string(),
          stack_name.to_string(),
        ))
        .map(|entry| entry.clone()),
    )
  }
  async fn upsert(
    &self,
    record: StackSourceRecord,
  ) -> anyhow::Result<()> {
    self.stack_sources.insert(
      (
        record.environment_id.clone(),
        record.stack_name.clone(),
      ),
      record,
    );
    Ok(())
  }
  async fn remove(
    &self,
    environment_id: &str,
    stack_name: &str,
  ) -> anyhow::Result<()> {
    self.stack_sources.remove(&(
      environment_id.to_string(),
      stack_name.to_string(),
    ));
    Ok(())
  }
}

#[async_trait]
impl StackEnvVarRepo for MemoryStore {
  async fn list(
    &self,
    environment_id: &str,
    stack_name: &str,
  ) -> anyhow::Result<Vec<StackEnvVar>> {
    Ok(
      self
        .stack_env_vars
        .read()
        .unwrap()
        .iter()
        .filter(|var| {
          var.environment_id == environment_id
            && var.stack_name == stack_name
        })
        .cloned()
        .collect(),
    )
  }
  async fn remove_for_stack(
    &self,
    environment_id: &str,
    stack_name: &str,
  ) -> anyhow::Result<()> {
    self.stack_env_vars.write().unwrap().retain(|var| {
      var.environment_id != environment_id
        || var.stack_name != stack_name
    });
    Ok(())
  }
}

#[async_trait]
impl ScheduleRepo for MemoryStore {
  async fn list(&self) -> anyhow::Result<Vec<Schedule>> {
    Ok(
      self
        .schedules
        .iter()
        .map(|entry| entry.value().clone())
        .collect(),
    )
  }
  async fn get(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<Schedule>> {
    Ok(self.schedules.get(id).map(|entry| entry.clone()))
  }
  async fn list_for_environment(
    &self,
    environment_id: &str,
  ) -> anyhow::Result<Vec<Schedule>> {
    Ok(
      self
        .schedules
        .iter()
        .filter(|entry| {
          entry.environment_id.as_deref() == Some(environment_id)
        })
        .map(|entry| entry.value().clone())
        .collect(),
    )
  }
}

#[async_trait]
impl ExecutionRepo for MemoryStore {
  async fn create(
    &self,
    execution: ScheduleExecution,
  ) -> anyhow::Result<()> {
    self.executions.insert(execution.id.clone(), execution);
    Ok(())
  }
  async fn set_started(
    &self,
    id: &str,
    started_at: i64,
  ) -> anyhow::Result<()> {
    if let Some(mut execution) = self.executions.get_mut(id) {
      execution.started_at = Some(started_at);
      execution.status = ExecutionStatus::Running;
    }
    Ok(())
  }
  async fn append_logs(
    &self,
    id: &str,
    lines: &str,
  ) -> anyhow::Result<()> {
    if let Some(mut execution) = self.executions.get_mut(id) {
      execution.logs.push_str(lines);
    }
    Ok(())
  }
  async fn finalize(
    &self,
    id: &str,
    status: ExecutionStatus,
    error: Option<String>,
    details: Value,
    completed_at: i64,
    duration_ms: i64,
  ) -> anyhow::Result<()> {
    if let Some(mut execution) = self.executions.get_mut(id) {
      execution.status = status;
      execution.error = error;
      execution.details = details;
      execution.completed_at = Some(completed_at);
      execution.duration_ms = Some(duration_ms);
    }
    Ok(())
  }
  async fn delete_older_than(
    &self,
    ts: i64,
  ) -> anyhow::Result<u64> {
    let stale = self
      .executions
      .iter()
      .filter(|entry| entry.triggered_at < ts)
      .map(|entry| entry.key().clone())
      .collect::<Vec<_>>();
    let deleted = stale.len() as u64;
    for id in stale {
      self.executions.remove(&id);
    }
    Ok(deleted)
  }
}

#[async_trait]
impl ContainerEventRepo for MemoryStore {
  async fn insert(
    &self,
    event: ContainerEvent,
  ) -> anyhow::Result<()> {
    self.container_events.write().unwrap().push(event);
    Ok(())
  }
  async fn delete_older_than(
    &self,
    ts: i64,
  ) -> anyhow::Result<u64> {
    let mut events = self.container_events.write().unwrap();
    let before = events.len();
    events.retain(|event| event.timestamp >= ts);
    Ok((before - events.len()) as u64)
  }
}

#[async_trait]
impl HostMetricRepo for MemoryStore {
  async fn insert(
    &self,
    metric: HostMetric,
  ) -> anyhow::Result<()> {
    self.host_metrics.write().unwrap().push(metric);
    Ok(())
  }
}

#[async_trait]
impl ScanRepo for MemoryStore {
  async fn insert(
    &self,
    scan: VulnerabilityScan,
  ) -> anyhow::Result<()> {
    self.scans.write().unwrap().push(scan);
    Ok(())
  }
  async fn latest_for_image(
    &self,
    environment_id: &str,
    image_id: &str,
  ) -> anyhow::Result<Option<VulnerabilityScan>> {
    Ok(
      self
        .scans
        .read()
        .unwrap()
        .iter()
        .filter(|scan| {
          scan.environment_id.as_deref() == Some(environment_id)
            && scan.image_id == image_id
            && scan.error.is_none()
        })
        .max_by_key(|scan| scan.scanned_at)
        .cloned(),
    )
  }
}

#[async_trait]
impl PendingUpdateRepo for MemoryStore {
  async fn upsert(
    &self,
    update: PendingContainerUpdate,
  ) -> anyhow::Result<()> {
    self.pending_updates.insert(
      (
        update.environment_id.clone(),
        update.container_id.clone(),
      ),
      update,
    );
    Ok(())
  }
  async fn remove(
    &self,
    environment_id: &str,
    container_id: &str,
  ) -> anyhow::Result<()> {
    self.pending_updates.remove(&(
      environment_id.to_string(),
      container_id.to_string(),
    ));
    Ok(())
  }
  async fn list_for_environment(
    &self,
    environment_id: &str,
  ) -> anyhow::Result<Vec<PendingContainerUpdate>> {
    Ok(
      self
        .pending_updates
        .iter()
        .filter(|entry| entry.environment_id == environment_id)
        .map(|entry| entry.value().clone())
        .collect(),
    )
  }
  async fn retain(
    &self,
    environment_id: &str,
    keep: &[String],
  ) -> anyhow::Result<()> {
    self.pending_updates.retain(|(env, container), _| {
      env != environment_id
        || keep.iter().any(|id| id == container)
    });
    Ok(())
  }
}

#[async_trait]
impl GitStackRepo for MemoryStore {
  async fn get(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<GitStack>> {
    Ok(self.git_stacks.get(id).map(|entry| entry.clone()))
  }
  async fn get_credential(
    &self,
    id: &str,
  ) -> anyhow::Result<Option<GitCredential>> {
    Ok(
      self
        .git_credentials
        .get(id)
        .map(|entry| entry.clone()),
    )
  }
}

#[async_trait]
impl SettingsRepo for MemoryStore {
  async fn get(
    &self,
    key: &str,
  ) -> anyhow::Result<Option<String>> {
    Ok(self.settings.get(key).map(|entry| entry.clone()))
  }
}

/// Logs every notification; real channels hang off the embedding
/// application.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
  async fn notify(
    &self,
    event: NotificationKind,
    payload: Value,
    environment_id: Option<&str>,
  ) -> anyhow::Result<()> {
    info!(
      "notification | {event} | env: {} | {payload}",
      environment_id.unwrap_or("-")
    );
    Ok(())
  }
}

pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
  async fn allow(
    &self,
    _user_id: &str,
    _resource: &str,
    _action: &str,
    _environment_id: Option<&str>,
  ) -> anyhow::Result<bool> {
    Ok(true)
  }
  async fn accessible_environments(
    &self,
    _user_id: &str,
  ) -> anyhow::Result<Vec<String>> {
    Ok(Vec::new())
  }
}

/// Argon2id with the crate defaults. Verification goes through the
/// PHC string, so parameters can be tuned later without breaking
/// stored hashes.
pub struct Argon2Hasher;

impl CredentialHasher for Argon2Hasher {
  fn hash(&self, secret: &str) -> anyhow::Result<String> {
    use argon2::{
      Argon2,
      password_hash::{PasswordHasher, SaltString, rand_core::OsRng},
    };
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
      .hash_password(secret.as_bytes(), &salt)
      .map(|hash| hash.to_string())
      .map_err(|e| anyhow::anyhow!("argon2 hash failed | {e}"))
  }
  fn verify(&self, secret: &str, hash: &str) -> bool {
    use argon2::{
      Argon2,
      password_hash::{PasswordHash, PasswordVerifier},
    };
    PasswordHash::new(hash)
      .map(|parsed| {
        Argon2::default()
          .verify_password(secret.as_bytes(), &parsed)
          .is_ok()
      })
      .unwrap_or(false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use stevedore_client::entities::stevedore_timestamp;

  #[tokio::test]
  async fn pending_updates_retain_keeps_only_listed_ids() {
    let store = MemoryStore::default();
    for id in ["c1", "c2", "c3"] {
      PendingUpdateRepo::upsert(&store, PendingContainerUpdate {
          environment_id: String::from("env1"),
          container_id: id.to_string(),
          container_name: id.to_string(),
          current_image: String::from("nginx:1.25"),
          checked_at: stevedore_timestamp(),
        })
        .await
        .unwrap();
    }
    PendingUpdateRepo::upsert(&store, PendingContainerUpdate {
      environment_id: String::from("env2"),
      container_id: String::from("c9"),
      container_name: String::from("c9"),
      current_image: String::from("redis:7"),
      checked_at: stevedore_timestamp(),
    })
    .await
    .unwrap();

    PendingUpdateRepo::retain(
      &store,
      "env1",
      &[String::from("c2")],
    )
    .await
    .unwrap();

    let env1 =
      PendingUpdateRepo::list_for_environment(&store, "env1")
        .await
        .unwrap();
    assert_eq!(env1.len(), 1);
    assert_eq!(env1[0].container_id, "c2");
    // Other environments are untouched.
    assert_eq!(
      PendingUpdateRepo::list_for_environment(&store, "env2")
        .await
        .unwrap()
        .len(),
      1
    );
  }

  #[tokio::test]
  async fn execution_lifecycle_reaches_terminal_state() {
    let store = MemoryStore::default();
    let execution = ScheduleExecution {
      id: String::from("x1"),
      triggered_at: 100,
      ..Default::default()
    };
    ExecutionRepo::create(&store, execution).await.unwrap();
    store.set_started("x1", 110).await.unwrap();
    store.append_logs("x1", "line one\n").await.unwrap();
    store.append_logs("x1", "line two\n").await.unwrap();
    store
      .finalize(
        "x1",
        ExecutionStatus::Success,
        None,
        Value::Null,
        200,
        100,
      )
      .await
      .unwrap();
    let row = store.executions.get("x1").unwrap();
    assert!(row.status.terminal());
    assert_eq!(row.logs, "line one\nline two\n");
    assert_eq!(row.duration_ms, Some(100));
  }

  #[test]
  fn argon2_hasher_round_trips() {
    let hasher = Argon2Hasher;
    let hash = hasher.hash("sekrit").unwrap();
    // PHC string identifying the algorithm as argon2id.
    assert!(hash.starts_with("$argon2id$"));
    assert!(hasher.verify("sekrit", &hash));
    assert!(!hasher.verify("wrong", &hash));
    assert!(!hasher.verify("sekrit", "not a phc string"));
  }
}
