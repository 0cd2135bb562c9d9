//! Discoverd's client side: API client, heartbeater, and resumable watch.

mod client;
mod heartbeat;
mod watch;

pub use client::{Client, EventStream, LeaderStream, DEFAULT_URL};
pub use heartbeat::{
    env_meta, expand_addr, HeartbeatConfig, Heartbeater, DEFAULT_META_ENV,
};
pub use watch::{Connector, Watch, WatchMirror, WatchState};
