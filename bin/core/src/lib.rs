//! Stevedore core: a control plane for container daemons across
//! many environments. The api surface embedding this crate drives
//! the entry points (compose, update, schedule, tokens), while the
//! background machinery (collectors, scheduler, agent gateway)
//! runs on its own once spawned.

#[macro_use]
extern crate tracing;

pub mod broker;
pub mod compose;
pub mod config;
pub mod defaults;
pub mod docker;
pub mod environments;
pub mod execution;
pub mod gateway;
pub mod notify;
pub mod permission;
pub mod registry;
pub mod router;
pub mod schedule;
pub mod stack;
pub mod state;
pub mod store;
pub mod tokens;
pub mod update;
pub mod workers;
