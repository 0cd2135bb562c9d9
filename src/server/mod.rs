//! Discoverd's server side: replicated registry, HTTP and DNS surfaces.

mod command;
mod consensus;
mod dns;
mod external;
mod membership;
mod statemach;
mod store;
mod subscription;

pub use command::{Command, ExpireTarget};
pub use consensus::{ApplyResult, Consensus, Fsm, MemCluster, MemNode};
pub use dns::{
    normalize_recursors, DnsConfig, DnsServer, DnsStore, DnsStoreSwitch,
    ProxyStore,
};
pub use external::{
    ApiBody, Backend, ErrorEnvelope, ExternalApi, HttpHandler, RaftLeader,
    StatusData, StatusReport, TargetLogIndex, INDEX_HEADER, MAX_BODY_BYTES,
    PEERS_HEADER,
};
pub use membership::Membership;
pub use statemach::{RegistryData, StateMachine};
pub use store::{Store, StoreConfig};
pub use subscription::Subscription;

#[cfg(test)]
pub(crate) use external::TestPeer;
