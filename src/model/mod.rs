//! Registry entities shared by server and client: instances, service config
//! and metadata, and the change events that describe them.

mod event;
mod instance;
mod service;

pub use event::{Event, EventKind, EventKinds};
pub use instance::{instance_id, split_host_port, Instance};
pub use service::{valid_service_name, LeaderType, ServiceConfig, ServiceMeta};
