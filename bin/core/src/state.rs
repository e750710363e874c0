use std::sync::{Arc, OnceLock};

use crate::{
  broker::Broker,
  notify::Notifier,
  permission::{Authorizer, CredentialHasher},
  store::Store,
};

/// Wires in the external collaborators. Must run once before the
/// server starts; accessors panic if called earlier, which is an
/// init ordering bug, not a runtime condition.
pub fn init_services(
  store: Arc<dyn Store>,
  notifier: Arc<dyn Notifier>,
  authorizer: Arc<dyn Authorizer>,
  hasher: Arc<dyn CredentialHasher>,
) {
  STORE.set(store).ok().expect("services initialized twice");
  NOTIFIER
    .set(notifier)
    .ok()
    .expect("services initialized twice");
  AUTHORIZER
    .set(authorizer)
    .ok()
    .expect("services initialized twice");
  HASHER.set(hasher).ok().expect("services initialized twice");
}

static STORE: OnceLock<Arc<dyn Store>> = OnceLock::new();
static NOTIFIER: OnceLock<Arc<dyn Notifier>> = OnceLock::new();
static AUTHORIZER: OnceLock<Arc<dyn Authorizer>> = OnceLock::new();
static HASHER: OnceLock<Arc<dyn CredentialHasher>> = OnceLock::new();

pub fn store() -> &'static Arc<dyn Store> {
  STORE.get().expect("store accessed before init_services")
}

pub fn notifier() -> &'static Arc<dyn Notifier> {
  NOTIFIER.get().expect("notifier accessed before init_services")
}

pub fn authorizer() -> &'static Arc<dyn Authorizer> {
  AUTHORIZER
    .get()
    .expect("authorizer accessed before init_services")
}

pub fn credential_hasher() -> &'static Arc<dyn CredentialHasher> {
  HASHER.get().expect("hasher accessed before init_services")
}

pub fn broker() -> &'static Broker {
  static BROKER: OnceLock<Broker> = OnceLock::new();
  BROKER.get_or_init(Default::default)
}
