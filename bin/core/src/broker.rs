//! In-process pub/sub. Emission is fire and forget: consumers that
//! fall behind lose messages rather than applying backpressure to
//! producers.

use serde_json::Value;
use stevedore_client::entities::event::{ContainerEvent, EnvStatus};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 4096;

pub struct Broker {
  container_events: broadcast::Sender<ContainerEvent>,
  env_status: broadcast::Sender<EnvStatus>,
  audit: broadcast::Sender<Value>,
}

impl Default for Broker {
  fn default() -> Broker {
    Broker {
      container_events: broadcast::channel(CHANNEL_CAPACITY).0,
      env_status: broadcast::channel(CHANNEL_CAPACITY).0,
      audit: broadcast::channel(CHANNEL_CAPACITY).0,
    }
  }
}

impl Broker {
  pub fn publish_container_event(&self, event: ContainerEvent) {
    // send only errors when there are no receivers.
    let _ = self.container_events.send(event);
  }

  pub fn publish_env_status(&self, status: EnvStatus) {
    let _ = self.env_status.send(status);
  }

  pub fn publish_audit(&self, payload: Value) {
    let _ = self.audit.send(payload);
  }

  pub fn subscribe_container_events(
    &self,
  ) -> broadcast::Receiver<ContainerEvent> {
    self.container_events.subscribe()
  }

  pub fn subscribe_env_status(
    &self,
  ) -> broadcast::Receiver<EnvStatus> {
    self.env_status.subscribe()
  }

  pub fn subscribe_audit(&self) -> broadcast::Receiver<Value> {
    self.audit.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn multiple_consumers_each_get_the_event() {
    let broker = Broker::default();
    let mut a = broker.subscribe_container_events();
    let mut b = broker.subscribe_container_events();
    broker.publish_container_event(ContainerEvent {
      environment_id: "env1".into(),
      container_id: "c1".into(),
      action: "start".into(),
      ..Default::default()
    });
    assert_eq!(a.recv().await.unwrap().container_id, "c1");
    assert_eq!(b.recv().await.unwrap().container_id, "c1");
  }

  #[tokio::test]
  async fn publish_without_consumers_does_not_error() {
    let broker = Broker::default();
    broker.publish_env_status(EnvStatus {
      environment_id: "env1".into(),
      name: "local".into(),
      online: true,
      error: None,
    });
  }
}
