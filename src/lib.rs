//! Discoverd: replicated service discovery and leader election registry.
//!
//! Peers keep a registry of services, their instances, per-service metadata,
//! and per-service leaders in a replicated state machine. Clients register
//! instances over HTTP and keep them alive by heartbeating; the cluster
//! leader expires instances that stop heartbeating. Changes are streamed to
//! subscribers and exposed through DNS.

#[macro_use]
mod utils;

pub mod client;
pub mod model;
pub mod server;

pub use utils::{logger_init, Attempts, DiscoverdError, Timer, ME};
