use async_trait::async_trait;
use serde_json::Value;
use strum::Display;

/// Fans an event out to whatever channels are subscribed.
/// Delivery is someone else's problem; the core only emits.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
  async fn notify(
    &self,
    event: NotificationKind,
    payload: Value,
    environment_id: Option<&str>,
  ) -> anyhow::Result<()>;
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
  ContainerEvent,
  EnvironmentOnline,
  EnvironmentOffline,
  DiskWarning,
  AutoUpdateBlocked,
  AutoUpdateSuccess,
  AutoUpdateAvailable,
  VulnerabilitiesFound,
}

/// Emit without letting notifier failures bubble into the caller.
pub async fn notify_best_effort(
  event: NotificationKind,
  payload: Value,
  environment_id: Option<&str>,
) {
  if let Err(e) = crate::state::notifier()
    .notify(event, payload, environment_id)
    .await
  {
    warn!("failed to dispatch {event} notification | {e:#}");
  }
}
