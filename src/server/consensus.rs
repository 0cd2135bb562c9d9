//! Consensus seam between the registry state machine and log replication.
//!
//! The store only relies on the `Consensus` trait: proposals are ordered and
//! applied through `Fsm::apply` on every member, leadership edges are
//! published on a watch channel, and membership can be changed by the
//! leader. `MemCluster` is an in-process replicated log implementing this
//! contract; every member applies committed entries in the same order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::utils::DiscoverdError;

use async_trait::async_trait;

use parking_lot::Mutex;

use tokio::sync::watch;

/// Result of applying one command to the state machine.
pub type ApplyResult = Result<(), DiscoverdError>;

/// Deterministic state machine driven by the replicated log.
pub trait Fsm: Send + Sync {
    /// Applies the command at log position `index`. Must not block on I/O.
    fn apply(&self, index: u64, cmd: &[u8]) -> ApplyResult;

    /// Serializes the whole state.
    fn snapshot(&self) -> Result<Vec<u8>, DiscoverdError>;

    /// Replaces the whole state from a snapshot.
    fn restore(&self, snap: &[u8]) -> Result<(), DiscoverdError>;
}

/// Replication module as seen by one member.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Appends a command to the log and waits until it is applied locally.
    /// Returns the log index it was committed at; apply failures surface as
    /// the error of the proposal. Fails with `NotLeader` on non-leaders.
    async fn propose(&self, cmd: Vec<u8>) -> Result<u64, DiscoverdError>;

    /// Advertised address of the current leader, if any is known.
    fn leader(&self) -> Option<String>;

    /// Whether this member currently leads.
    fn is_leader(&self) -> bool {
        self.leader().as_deref() == Some(self.local_addr())
    }

    /// Receiver that flips whenever local leadership is gained or lost.
    fn leader_watch(&self) -> watch::Receiver<bool>;

    /// Adds a peer to the membership. Adding an existing peer is a no-op.
    /// Fails with `Validation` if the peer is not one this replication
    /// module can reach.
    async fn add_peer(&self, peer: &str) -> Result<(), DiscoverdError>;

    /// Removes a peer from the membership. Removing an unknown peer is a
    /// no-op.
    async fn remove_peer(&self, peer: &str) -> Result<(), DiscoverdError>;

    /// Current membership, sorted.
    fn peers(&self) -> Vec<String>;

    /// Index of the last applied log entry.
    fn last_index(&self) -> u64;

    /// Advertised address of this member.
    fn local_addr(&self) -> &str;
}

/// One joined member of a `MemCluster`.
struct MemberSlot {
    /// State machine fed by the log.
    fsm: Arc<dyn Fsm>,

    /// Sender side of this member's leadership watch.
    tx_leader: watch::Sender<bool>,
}

/// Shared state of the in-process cluster, guarded by a single lock.
struct ClusterState {
    /// Index of the last committed entry.
    log_index: u64,

    /// Current leader address.
    leader: Option<String>,

    /// Members that have joined and apply the log.
    members: BTreeMap<String, MemberSlot>,

    /// Membership configuration.
    peers: BTreeSet<String>,
}

impl ClusterState {
    fn set_leader(&mut self, leader: Option<String>) {
        if let Some(prev) = self.leader.take() {
            if let Some(slot) = self.members.get(&prev) {
                slot.tx_leader.send_replace(false);
            }
        }
        if let Some(addr) = &leader {
            if let Some(slot) = self.members.get(addr) {
                slot.tx_leader.send_replace(true);
            }
        }
        self.leader = leader;
    }
}

/// In-process replicated log. Cloning yields another handle to the same
/// cluster.
#[derive(Clone)]
pub struct MemCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemCluster {
    /// Creates an empty cluster with no members.
    pub fn new() -> Self {
        MemCluster {
            state: Arc::new(Mutex::new(ClusterState {
                log_index: 0,
                leader: None,
                members: BTreeMap::new(),
                peers: BTreeSet::new(),
            })),
        }
    }

    /// Joins a member at `addr` driving `fsm`. The first member becomes
    /// leader; later members are restored from the leader's snapshot before
    /// they start applying new entries.
    pub fn join(
        &self,
        addr: &str,
        fsm: Arc<dyn Fsm>,
    ) -> Result<MemNode, DiscoverdError> {
        let mut state = self.state.lock();
        if state.members.contains_key(addr) {
            return logged_err!("member {} already joined", addr);
        }

        let source = state
            .leader
            .as_ref()
            .and_then(|l| state.members.get(l))
            .or_else(|| state.members.values().next());
        if let Some(source) = source {
            let snap = source.fsm.snapshot()?;
            fsm.restore(&snap)?;
        }

        let (tx_leader, rx_leader) = watch::channel(false);
        state.members.insert(addr.into(), MemberSlot { fsm, tx_leader });
        state.peers.insert(addr.into());
        if state.leader.is_none() && state.members.len() == 1 {
            state.set_leader(Some(addr.into()));
        }
        pf_debug!("member {} joined, leader {:?}", addr, state.leader);

        Ok(MemNode {
            state: self.state.clone(),
            addr: addr.into(),
            rx_leader,
        })
    }

    /// Moves leadership to the member at `addr`.
    pub fn transfer_leadership(&self, addr: &str) -> Result<(), DiscoverdError> {
        let mut state = self.state.lock();
        if !state.members.contains_key(addr) {
            return logged_err!("cannot transfer leadership to unknown {}", addr);
        }
        state.set_leader(Some(addr.into()));
        pf_info!("leadership moved to {}", addr);
        Ok(())
    }

    /// Takes the member at `addr` out of the cluster: it stops applying the
    /// log and leaves the membership. If it led, the next remaining member
    /// in address order takes over.
    pub fn leave(&self, addr: &str) {
        let mut state = self.state.lock();
        if state.leader.as_deref() == Some(addr) {
            let next = state.members.keys().find(|a| *a != addr).cloned();
            state.set_leader(next);
        }
        let joined = state.members.remove(addr).is_some();
        if state.peers.remove(addr) || joined {
            pf_info!("member {} left, leader {:?}", addr, state.leader);
        }
    }

    /// Leaves the cluster without any leader.
    pub fn step_down(&self) {
        let mut state = self.state.lock();
        state.set_leader(None);
        pf_info!("cluster has no leader");
    }

    /// Current leader address.
    pub fn leader(&self) -> Option<String> {
        self.state.lock().leader.clone()
    }
}

impl Default for MemCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle of one member of a `MemCluster`.
pub struct MemNode {
    /// Shared cluster state.
    state: Arc<Mutex<ClusterState>>,

    /// Address this member advertises.
    addr: String,

    /// Receiver side of this member's leadership watch.
    rx_leader: watch::Receiver<bool>,
}

impl MemNode {
    fn ensure_leader(&self, state: &ClusterState) -> Result<(), DiscoverdError> {
        match &state.leader {
            Some(l) if *l == self.addr => Ok(()),
            _ => Err(DiscoverdError::NotLeader),
        }
    }
}

#[async_trait]
impl Consensus for MemNode {
    async fn propose(&self, cmd: Vec<u8>) -> Result<u64, DiscoverdError> {
        let mut state = self.state.lock();
        self.ensure_leader(&state)?;

        let index = state.log_index + 1;
        state.log_index = index;

        // every member applies in log order; results are identical
        let mut result = Ok(());
        for (addr, slot) in state.members.iter() {
            let res = slot.fsm.apply(index, &cmd);
            if *addr == self.addr {
                result = res;
            }
        }
        pf_trace!("committed entry {}", index);
        result.map(|_| index)
    }

    fn leader(&self) -> Option<String> {
        self.state.lock().leader.clone()
    }

    fn leader_watch(&self) -> watch::Receiver<bool> {
        self.rx_leader.clone()
    }

    async fn add_peer(&self, peer: &str) -> Result<(), DiscoverdError> {
        let mut state = self.state.lock();
        self.ensure_leader(&state)?;
        if !state.members.contains_key(peer) {
            return Err(DiscoverdError::Validation(format!(
                "discoverd: cannot add peer {}: only members joined to this \
                 process's log can be added",
                peer
            )));
        }
        if state.peers.insert(peer.into()) {
            pf_info!("added peer {}", peer);
        }
        Ok(())
    }

    async fn remove_peer(&self, peer: &str) -> Result<(), DiscoverdError> {
        let mut state = self.state.lock();
        self.ensure_leader(&state)?;
        if !state.peers.remove(peer) {
            return Ok(());
        }
        if state.leader.as_deref() == Some(peer) {
            state.set_leader(None);
        }
        state.members.remove(peer);
        pf_info!("removed peer {}", peer);
        Ok(())
    }

    fn peers(&self) -> Vec<String> {
        self.state.lock().peers.iter().cloned().collect()
    }

    fn last_index(&self) -> u64 {
        self.state.lock().log_index
    }

    fn local_addr(&self) -> &str {
        &self.addr
    }
}
