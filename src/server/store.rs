//! Store facade: validates requests, proposes commands through consensus,
//! records heartbeats on the leader and runs the expiry engine.

use std::sync::Arc;

use crate::model::{
    valid_service_name, EventKinds, Instance, ServiceConfig, ServiceMeta,
};
use crate::server::command::Command;
use crate::server::consensus::{Consensus, MemCluster};
use crate::server::statemach::StateMachine;
use crate::server::subscription::Subscription;
use crate::utils::DiscoverdError;

use parking_lot::Mutex;

use serde::{Deserialize, Serialize};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Store tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Heartbeat age after which an instance is expired.
    pub instance_ttl_ms: u64,

    /// Period of the expiry scan.
    pub expiry_check_interval_ms: u64,

    /// Upper bound on a single proposal.
    pub propose_timeout_ms: u64,

    /// Events a stream subscriber may lag behind before it is cut off.
    pub stream_buffer_size: usize,

    /// Idle time after which an event stream gets a keep-alive comment,
    /// so a hung-up client is noticed on a quiet service.
    pub stream_keepalive_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            instance_ttl_ms: 10_000,
            expiry_check_interval_ms: 1_000,
            propose_timeout_ms: 30_000,
            stream_buffer_size: 64,
            stream_keepalive_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Overlays fields from a TOML string onto the defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, DiscoverdError> {
        let config = parsed_config!(config_str => StoreConfig;
                                    instance_ttl_ms, expiry_check_interval_ms,
                                    propose_timeout_ms, stream_buffer_size,
                                    stream_keepalive_ms)?;
        if config.instance_ttl_ms == 0
            || config.expiry_check_interval_ms == 0
            || config.stream_keepalive_ms == 0
        {
            return Err(DiscoverdError::Validation(
                "instance TTL, expiry and keep-alive intervals must be positive"
                    .into(),
            ));
        }
        Ok(config)
    }

    pub fn instance_ttl(&self) -> Duration {
        Duration::from_millis(self.instance_ttl_ms)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_check_interval_ms)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn stream_keepalive(&self) -> Duration {
        Duration::from_millis(self.stream_keepalive_ms)
    }
}

/// Replicated registry as seen by one peer.
pub struct Store {
    /// Local state machine.
    fsm: Arc<StateMachine>,

    /// Replication module this peer is a member of.
    consensus: Arc<dyn Consensus>,

    /// Tuning knobs.
    config: StoreConfig,

    /// Sender side of the termination channel of background tasks.
    tx_term: watch::Sender<bool>,

    /// Join handles of the leadership watcher and expirer tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// Store public API implementation
impl Store {
    /// Opens a store over an already-joined state machine and spawns the
    /// leadership watcher and the expiry ticker. Must be called within a
    /// tokio runtime.
    pub fn open(
        fsm: Arc<StateMachine>,
        consensus: Arc<dyn Consensus>,
        config: StoreConfig,
    ) -> Arc<Self> {
        let (tx_term, rx_term) = watch::channel(false);

        // seed leadership state before any request can record heartbeats
        let mut rx_leader = consensus.leader_watch();
        let leading = *rx_leader.borrow_and_update();
        fsm.reset_leadership(leading.then(Instant::now));

        let store = Arc::new(Store {
            fsm,
            consensus,
            config,
            tx_term,
            tasks: Mutex::new(vec![]),
        });

        let watcher = tokio::spawn(Self::leadership_watcher(
            store.fsm.clone(),
            rx_leader,
            rx_term.clone(),
        ));
        let expirer =
            tokio::spawn(Self::expirer(Arc::downgrade(&store), rx_term));
        store.tasks.lock().extend([watcher, expirer]);

        pf_info!(
            "store opened at {} (ttl {} ms)",
            store.consensus.local_addr(),
            store.config.instance_ttl_ms
        );
        store
    }

    /// Convenience: joins `cluster` as `addr` with a fresh state machine and
    /// opens a store over it.
    pub fn open_in(
        cluster: &MemCluster,
        addr: &str,
        config: StoreConfig,
    ) -> Result<Arc<Self>, DiscoverdError> {
        let fsm = StateMachine::new();
        let node = cluster.join(addr, fsm.clone())?;
        Ok(Self::open(fsm, Arc::new(node), config))
    }

    /// Stops background tasks and closes all subscriptions.
    pub async fn close(&self) -> Result<(), DiscoverdError> {
        self.tx_term.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.await?;
        }
        self.fsm.close();
        pf_info!("store closed");
        Ok(())
    }

    pub fn config_ref(&self) -> &StoreConfig {
        &self.config
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.fsm
    }

    /// Proposes a command, bounded by the proposal timeout.
    async fn propose(&self, cmd: Command) -> Result<u64, DiscoverdError> {
        if *self.tx_term.borrow() {
            return Err(DiscoverdError::Shutdown);
        }
        let buf = cmd.encode()?;
        time::timeout(self.config.propose_timeout(), self.consensus.propose(buf))
            .await?
    }

    /// Creates a service.
    pub async fn add_service(
        &self,
        service: &str,
        config: ServiceConfig,
    ) -> Result<(), DiscoverdError> {
        valid_service_name(service)?;
        self.propose(Command::AddService {
            service: service.into(),
            config,
        })
        .await?;
        Ok(())
    }

    /// Deletes a service with all its instances and metadata.
    pub async fn remove_service(&self, service: &str) -> Result<(), DiscoverdError> {
        valid_service_name(service)?;
        self.propose(Command::RemoveService {
            service: service.into(),
        })
        .await?;
        Ok(())
    }

    /// Registers or heartbeats an instance. Only the leader accepts these;
    /// the heartbeat is recorded locally and a command is proposed only if
    /// the instance differs from what is registered.
    pub async fn add_instance(
        &self,
        service: &str,
        inst: &Instance,
    ) -> Result<(), DiscoverdError> {
        valid_service_name(service)?;
        inst.valid()?;
        if !self.consensus.is_leader() {
            return Err(DiscoverdError::NotLeader);
        }

        self.fsm.record_heartbeat(service, &inst.id, Instant::now());
        if self.fsm.has_identical(service, inst) {
            return Ok(());
        }

        self.propose(Command::AddInstance {
            service: service.into(),
            instance: inst.clone(),
        })
        .await?;
        Ok(())
    }

    /// Deregisters an instance.
    pub async fn remove_instance(
        &self,
        service: &str,
        id: &str,
    ) -> Result<(), DiscoverdError> {
        valid_service_name(service)?;
        self.propose(Command::RemoveInstance {
            service: service.into(),
            id: id.into(),
        })
        .await?;
        Ok(())
    }

    /// CAS-writes service metadata and returns what got stored, with its
    /// index set to the log index of the write.
    pub async fn set_service_meta(
        &self,
        service: &str,
        meta: ServiceMeta,
    ) -> Result<ServiceMeta, DiscoverdError> {
        valid_service_name(service)?;
        let index = self
            .propose(Command::SetServiceMeta {
                service: service.into(),
                meta: meta.clone(),
            })
            .await?;
        Ok(ServiceMeta::new(meta.data, index))
    }

    /// Installs a manual leader.
    pub async fn set_service_leader(
        &self,
        service: &str,
        id: &str,
    ) -> Result<(), DiscoverdError> {
        valid_service_name(service)?;
        self.propose(Command::SetLeader {
            service: service.into(),
            id: id.into(),
        })
        .await?;
        Ok(())
    }

    pub fn service_names(&self) -> Vec<String> {
        self.fsm.service_names()
    }

    pub fn config(&self, service: &str) -> Option<ServiceConfig> {
        self.fsm.config(service)
    }

    pub fn instances(&self, service: &str) -> Result<Vec<Instance>, DiscoverdError> {
        self.fsm.instances(service)
    }

    pub fn service_meta(&self, service: &str) -> Option<ServiceMeta> {
        self.fsm.service_meta(service)
    }

    pub fn service_leader(&self, service: &str) -> Option<Instance> {
        self.fsm.service_leader(service)
    }

    /// Subscribes to a service with the configured stream buffer.
    pub fn subscribe(
        &self,
        service: &str,
        send_current: bool,
        kinds: EventKinds,
    ) -> Result<Subscription, DiscoverdError> {
        self.fsm.subscribe(
            service,
            send_current,
            kinds,
            self.config.stream_buffer_size,
        )
    }

    /// Address of the current cluster leader.
    pub fn leader(&self) -> Option<String> {
        self.consensus.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    pub fn local_addr(&self) -> &str {
        self.consensus.local_addr()
    }

    pub async fn add_peer(&self, peer: &str) -> Result<(), DiscoverdError> {
        self.consensus.add_peer(peer).await
    }

    pub async fn remove_peer(&self, peer: &str) -> Result<(), DiscoverdError> {
        self.consensus.remove_peer(peer).await
    }

    pub fn peers(&self) -> Vec<String> {
        self.consensus.peers()
    }

    pub fn last_index(&self) -> u64 {
        self.consensus.last_index()
    }

    /// Runs one expiry scan now.
    pub async fn enforce_expiry(&self) -> Result<usize, DiscoverdError> {
        self.enforce_expiry_at(Instant::now()).await
    }

    /// Runs one expiry scan as of `now`, proposing a single batch command
    /// for all lapsed instances. Returns how many were targeted.
    pub async fn enforce_expiry_at(
        &self,
        now: Instant,
    ) -> Result<usize, DiscoverdError> {
        if !self.consensus.is_leader() {
            return Err(DiscoverdError::NotLeader);
        }
        let targets = self.fsm.expirable(now, self.config.instance_ttl())?;
        if targets.is_empty() {
            return Ok(0);
        }

        let count = targets.len();
        pf_info!("expiring {} instances", count);
        self.propose(Command::ExpireInstances { instances: targets })
            .await?;
        Ok(count)
    }
}

// Store background tasks
impl Store {
    /// Clears the heartbeat table on every leadership edge.
    async fn leadership_watcher(
        fsm: Arc<StateMachine>,
        mut rx_leader: watch::Receiver<bool>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = rx_leader.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let leading = *rx_leader.borrow_and_update();
                    pf_info!("leadership {}", if leading { "acquired" } else { "lost" });
                    fsm.reset_leadership(leading.then(Instant::now));
                },

                _ = rx_term.changed() => break,
            }
        }
        pf_debug!("leadership watcher exited");
    }

    /// Periodically expires lapsed instances while leading.
    async fn expirer(
        store: std::sync::Weak<Store>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        let period = match store.upgrade() {
            Some(s) => s.config.expiry_check_interval(),
            None => return,
        };
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    match store.enforce_expiry().await {
                        Ok(_) => {}
                        Err(DiscoverdError::NotLeader)
                        | Err(DiscoverdError::LeaderWait) => {}
                        Err(e) => pf_warn!("enforce expiry: {}", e),
                    }
                },

                _ = rx_term.changed() => break,
            }
        }
        pf_debug!("expirer exited");
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use crate::model::{EventKind, LeaderType};
    use std::collections::BTreeMap;

    fn test_config(ttl_ms: u64) -> StoreConfig {
        StoreConfig {
            instance_ttl_ms: ttl_ms,
            expiry_check_interval_ms: 20,
            ..Default::default()
        }
    }

    fn inst(addr: &str) -> Instance {
        Instance::new(addr, "tcp", BTreeMap::new())
    }

    #[test]
    fn parse_store_config() -> Result<(), DiscoverdError> {
        let config = StoreConfig::parse(Some("instance_ttl_ms = 100"))?;
        assert_eq!(config.instance_ttl(), Duration::from_millis(100));
        assert_eq!(config.stream_buffer_size, 64);
        assert!(StoreConfig::parse(Some("ttl = 1")).is_err());
        assert!(StoreConfig::parse(Some("instance_ttl_ms = 0")).is_err());
        assert!(StoreConfig::parse(Some("stream_keepalive_ms = 0")).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn heartbeat_without_proposal() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let store = Store::open_in(&cluster, "127.0.0.1:1111", test_config(10_000))?;
        store.add_service("a", ServiceConfig::default()).await?;
        assert!(store
            .add_service("A", ServiceConfig::default())
            .await
            .is_err_and(|e| e.is_validation()));

        let i1 = inst("10.0.0.1:80");
        store.add_instance("a", &i1).await?;
        let index = store.last_index();
        store.add_instance("a", &i1).await?;
        assert_eq!(store.last_index(), index);
        assert_eq!(store.state_machine().heartbeat_count(), 1);

        let mut bad = i1.clone();
        bad.id = "0000".into();
        assert!(store
            .add_instance("a", &bad)
            .await
            .is_err_and(|e| e.is_validation()));
        store.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn follower_rejects_writes() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let leader = Store::open_in(&cluster, "127.0.0.1:1111", test_config(10_000))?;
        let follower =
            Store::open_in(&cluster, "127.0.0.2:1111", test_config(10_000))?;
        leader.add_service("a", ServiceConfig::manual()).await?;
        assert_eq!(follower.config("a").map(|c| c.leader_type), Some(LeaderType::Manual));

        assert_eq!(
            follower.add_instance("a", &inst("10.0.0.1:80")).await,
            Err(DiscoverdError::NotLeader)
        );
        assert_eq!(follower.state_machine().heartbeat_count(), 0);
        assert_eq!(follower.leader().as_deref(), Some("127.0.0.1:1111"));
        assert_eq!(follower.enforce_expiry().await, Err(DiscoverdError::NotLeader));
        leader.close().await?;
        follower.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn meta_index_is_log_index() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let store = Store::open_in(&cluster, "127.0.0.1:1111", test_config(10_000))?;
        store.add_service("a", ServiceConfig::default()).await?;
        let meta = store
            .set_service_meta("a", ServiceMeta::new("foo".into(), 0))
            .await?;
        assert_eq!(meta.index, store.last_index());
        assert_eq!(store.service_meta("a"), Some(meta.clone()));
        assert!(store
            .set_service_meta("a", ServiceMeta::new("bar".into(), meta.index - 1))
            .await
            .is_err_and(|e| e.is_precondition_failed()));
        store.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expiry_after_silence() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let leader = Store::open_in(&cluster, "127.0.0.1:1111", test_config(100))?;
        let follower = Store::open_in(&cluster, "127.0.0.2:1111", test_config(100))?;
        leader.add_service("a", ServiceConfig::default()).await?;
        let mut sub = follower.subscribe("a", false, EventKinds::DOWN)?;

        let i1 = inst("10.0.0.1:80");
        leader.add_instance("a", &i1).await?;
        let start = Instant::now();
        let event = time::timeout(Duration::from_secs(2), sub.recv())
            .await?
            .ok_or_else(|| DiscoverdError::msg("stream ended"))?;
        assert_eq!(event.kind, EventKind::Down);
        assert_eq!(event.instance.map(|i| i.id), Some(i1.id));
        // leadership is fresh, so the 2x TTL grace applies
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(follower.instances("a")?.is_empty());
        leader.close().await?;
        follower.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leadership_change_waits() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let s1 = Store::open_in(&cluster, "127.0.0.1:1111", test_config(10_000))?;
        let s2 = Store::open_in(&cluster, "127.0.0.2:1111", test_config(10_000))?;
        s1.add_service("a", ServiceConfig::default()).await?;
        s1.add_instance("a", &inst("10.0.0.1:80")).await?;

        cluster.transfer_leadership("127.0.0.2:1111")?;
        // let the watcher observe the edge
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s2.enforce_expiry().await, Err(DiscoverdError::LeaderWait));
        assert_eq!(s1.state_machine().heartbeat_count(), 0);

        let later = Instant::now() + Duration::from_secs(25);
        assert_eq!(s2.enforce_expiry_at(later).await?, 1);
        assert!(s1.instances("a")?.is_empty());
        s1.close().await?;
        s2.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_ends_streams() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let store = Store::open_in(&cluster, "127.0.0.1:1111", test_config(10_000))?;
        let mut sub = store.subscribe("a", true, EventKinds::all())?;
        assert_eq!(sub.recv().await.map(|e| e.kind), Some(EventKind::Current));
        store.close().await?;
        assert_eq!(sub.recv().await, None);
        assert_eq!(sub.err(), None);
        assert_eq!(
            store.add_service("b", ServiceConfig::default()).await,
            Err(DiscoverdError::Shutdown)
        );
        Ok(())
    }
}
