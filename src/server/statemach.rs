//! Registry state machine: applies replicated commands, serves local reads,
//! keeps the leader-local heartbeat table, and fans events out to
//! subscribers. Everything lives behind one read-write lock so that event
//! delivery follows apply order exactly.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::model::{
    Event, EventKind, EventKinds, Instance, LeaderType, ServiceConfig,
    ServiceMeta,
};
use crate::server::command::{Command, ExpireTarget};
use crate::server::consensus::{ApplyResult, Fsm};
use crate::server::subscription::{Delivery, Subscriber, Subscription};
use crate::utils::DiscoverdError;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};

use tokio::time::{Duration, Instant};

/// Replicated part of the registry; this is what snapshots carry.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryData {
    /// Service name -> config.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    /// Service name -> metadata.
    #[serde(default)]
    pub metas: BTreeMap<String, ServiceMeta>,

    /// Service name -> leader instance ID (empty string for none).
    #[serde(default)]
    pub leaders: BTreeMap<String, String>,

    /// Service name -> instance ID -> instance.
    #[serde(default)]
    pub instances: BTreeMap<String, BTreeMap<String, Instance>>,
}

impl RegistryData {
    /// Instances of a service sorted ascending by index.
    fn sorted_instances(&self, service: &str) -> Vec<Instance> {
        let mut list: Vec<Instance> = self
            .instances
            .get(service)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.index.cmp(&b.index).then(a.id.cmp(&b.id)));
        list
    }

    fn leader(&self, service: &str) -> Option<Instance> {
        let id = self.leaders.get(service)?;
        self.instances.get(service)?.get(id).cloned()
    }
}

/// Everything guarded by the state machine lock.
struct RegistryState {
    /// Replicated data.
    data: RegistryData,

    /// Leader-local last heartbeat per `(service, id)`. Never replicated.
    heartbeats: HashMap<(String, String), Instant>,

    /// When local leadership was last acquired, `None` while following.
    leader_since: Option<Instant>,

    /// Service -> subscription ID -> subscriber, in creation order.
    subscribers: HashMap<String, BTreeMap<u64, Subscriber>>,

    /// Next subscription ID to hand out.
    next_sub_id: u64,

    /// Set once the owning store shuts down.
    closed: bool,
}

impl RegistryState {
    /// Delivers an event to the service's subscribers, dropping any that
    /// cannot keep up.
    fn broadcast(&mut self, event: Event) {
        pf_debug!("broadcasting {}", event);

        let Some(subs) = self.subscribers.get_mut(&event.service) else {
            return;
        };
        subs.retain(|id, sub| match sub.offer(&event) {
            Delivery::Kept => true,
            Delivery::Blocked => {
                pf_warn!(
                    "subscription {} on {} blocked, closing",
                    id,
                    event.service
                );
                false
            }
            Delivery::Gone => false,
        });
        if subs.is_empty() {
            self.subscribers.remove(&event.service);
        }
    }

    /// Recomputes the leader of an `oldest` service, returning a `Leader`
    /// event if the pointer moved.
    fn invalidate_leader(&mut self, service: &str) -> Option<Event> {
        let config = self.data.services.get(service)?;
        if config.leader_type == LeaderType::Manual {
            return None;
        }

        let oldest = self
            .data
            .instances
            .get(service)
            .and_then(|m| m.values().min_by_key(|i| (i.index, i.id.clone())))
            .cloned();
        let new_id = oldest.as_ref().map(|i| i.id.clone()).unwrap_or_default();
        let prev_id = self
            .data
            .leaders
            .insert(service.into(), new_id.clone())
            .unwrap_or_default();

        if prev_id == new_id {
            return None;
        }
        Some(Event::instance(service, EventKind::Leader, oldest))
    }

    fn forget_heartbeat(&mut self, service: &str, id: &str) {
        self.heartbeats.remove(&(service.to_string(), id.to_string()));
    }

    fn apply_cmd(
        &mut self,
        index: u64,
        cmd: Command,
        events: &mut Vec<Event>,
    ) -> ApplyResult {
        match cmd {
            Command::AddService { service, config } => {
                if self.data.services.contains_key(&service) {
                    return Err(DiscoverdError::service_exists(&service));
                }
                self.data.services.insert(service, config);
            }

            Command::RemoveService { service } => {
                if self.data.services.remove(&service).is_none() {
                    return Err(DiscoverdError::service_not_found(&service));
                }
                for inst in self.data.sorted_instances(&service) {
                    self.forget_heartbeat(&service, &inst.id);
                    events.push(Event::instance(
                        &service,
                        EventKind::Down,
                        Some(inst),
                    ));
                }
                self.data.instances.remove(&service);
                self.data.metas.remove(&service);
                self.data.leaders.remove(&service);
            }

            Command::SetServiceMeta { service, mut meta } => {
                if !self.data.services.contains_key(&service) {
                    return Err(DiscoverdError::service_not_found(&service));
                }
                match (meta.index, self.data.metas.get(&service)) {
                    (0, Some(_)) => {
                        return Err(DiscoverdError::ObjectExists(format!(
                            "Service metadata for {:?} already exists, use index=n to set",
                            service
                        )))
                    }
                    (0, None) => {}
                    (_, None) => {
                        return Err(DiscoverdError::PreconditionFailed(format!(
                            "Service metadata for {:?} does not exist, use index=0 to set",
                            service
                        )))
                    }
                    (given, Some(curr)) if given != curr.index => {
                        return Err(DiscoverdError::PreconditionFailed(format!(
                            "Service metadata for {:?} exists, but wrong index provided",
                            service
                        )))
                    }
                    _ => {}
                }

                let leader_id = meta.leader_id.take().filter(|id| !id.is_empty());
                meta.index = index;
                self.data.metas.insert(service.clone(), meta.clone());
                events.push(Event::meta(&service, meta));

                if let Some(id) = leader_id {
                    let inst = self
                        .data
                        .instances
                        .get(&service)
                        .and_then(|m| m.get(&id))
                        .cloned();
                    if let Some(inst) = inst {
                        self.data.leaders.insert(service.clone(), id);
                        events.push(Event::instance(
                            &service,
                            EventKind::Leader,
                            Some(inst),
                        ));
                    }
                }
            }

            Command::SetLeader { service, id } => {
                let inst = self
                    .data
                    .instances
                    .get(&service)
                    .and_then(|m| m.get(&id))
                    .cloned();
                self.data.leaders.insert(service.clone(), id);
                if let Some(inst) = inst {
                    events.push(Event::instance(
                        &service,
                        EventKind::Leader,
                        Some(inst),
                    ));
                }
            }

            Command::AddInstance {
                service,
                mut instance,
            } => {
                if !self.data.services.contains_key(&service) {
                    return Err(DiscoverdError::service_not_found(&service));
                }
                let insts =
                    self.data.instances.entry(service.clone()).or_default();

                let kind = match insts.get(&instance.id) {
                    None => {
                        instance.index = index;
                        Some(EventKind::Up)
                    }
                    Some(prev) => {
                        instance.index = prev.index;
                        if prev.identical(&instance) {
                            None
                        } else {
                            Some(EventKind::Update)
                        }
                    }
                };
                insts.insert(instance.id.clone(), instance.clone());

                if let Some(kind) = kind {
                    events.push(Event::instance(&service, kind, Some(instance)));
                }
                events.extend(self.invalidate_leader(&service));
            }

            Command::RemoveInstance { service, id } => {
                if !self.data.services.contains_key(&service) {
                    return Err(DiscoverdError::service_not_found(&service));
                }
                let removed = self
                    .data
                    .instances
                    .get_mut(&service)
                    .and_then(|m| m.remove(&id));
                self.forget_heartbeat(&service, &id);
                if let Some(inst) = removed {
                    events.push(Event::instance(
                        &service,
                        EventKind::Down,
                        Some(inst),
                    ));
                }
                events.extend(self.invalidate_leader(&service));
            }

            Command::ExpireInstances { instances } => {
                let mut touched = BTreeSet::new();
                for ExpireTarget { service, id } in instances {
                    let removed = self
                        .data
                        .instances
                        .get_mut(&service)
                        .and_then(|m| m.remove(&id));
                    let Some(inst) = removed else {
                        continue;
                    };
                    self.forget_heartbeat(&service, &id);
                    events.push(Event::instance(
                        &service,
                        EventKind::Down,
                        Some(inst),
                    ));
                    touched.insert(service);
                }
                for service in touched {
                    events.extend(self.invalidate_leader(&service));
                }
            }
        }
        Ok(())
    }
}

/// The registry state machine. Shared as `Arc<StateMachine>` between the
/// consensus module, the store facade, and subscription handles.
pub struct StateMachine {
    state: RwLock<RegistryState>,
}

// StateMachine public API implementation
impl StateMachine {
    /// Creates an empty state machine.
    pub fn new() -> Arc<Self> {
        Arc::new(StateMachine {
            state: RwLock::new(RegistryState {
                data: RegistryData::default(),
                heartbeats: HashMap::new(),
                leader_since: None,
                subscribers: HashMap::new(),
                next_sub_id: 0,
                closed: false,
            }),
        })
    }

    /// Sorted names of all services.
    pub fn service_names(&self) -> Vec<String> {
        self.state.read().data.services.keys().cloned().collect()
    }

    /// Config of a service, if it exists.
    pub fn config(&self, service: &str) -> Option<ServiceConfig> {
        self.state.read().data.services.get(service).copied()
    }

    /// Instances of a service sorted by index. Fails with `ObjectNotFound`
    /// if the service does not exist.
    pub fn instances(
        &self,
        service: &str,
    ) -> Result<Vec<Instance>, DiscoverdError> {
        let state = self.state.read();
        if !state.data.services.contains_key(service) {
            return Err(DiscoverdError::service_not_found(service));
        }
        Ok(state.data.sorted_instances(service))
    }

    /// Current metadata of a service.
    pub fn service_meta(&self, service: &str) -> Option<ServiceMeta> {
        self.state.read().data.metas.get(service).cloned()
    }

    /// Current leader instance of a service.
    pub fn service_leader(&self, service: &str) -> Option<Instance> {
        self.state.read().data.leader(service)
    }

    /// Whether an instance identical to `inst` is already registered.
    pub fn has_identical(&self, service: &str, inst: &Instance) -> bool {
        self.state
            .read()
            .data
            .instances
            .get(service)
            .and_then(|m| m.get(&inst.id))
            .is_some_and(|prev| prev.identical(inst))
    }

    /// Copy of the replicated data.
    pub fn data(&self) -> RegistryData {
        self.state.read().data.clone()
    }

    /// Records a heartbeat for an instance. Only meaningful on the leader.
    pub fn record_heartbeat(&self, service: &str, id: &str, now: Instant) {
        self.state
            .write()
            .heartbeats
            .insert((service.into(), id.into()), now);
    }

    /// Number of tracked heartbeats.
    pub fn heartbeat_count(&self) -> usize {
        self.state.read().heartbeats.len()
    }

    /// Handles a leadership edge: the heartbeat table is always cleared;
    /// `since` is the acquisition time or `None` when leadership was lost.
    pub fn reset_leadership(&self, since: Option<Instant>) {
        let mut state = self.state.write();
        state.heartbeats.clear();
        state.leader_since = since;
    }

    /// Collects every instance whose last heartbeat is older than `ttl`.
    /// Instances that never heartbeated this leader count from the moment
    /// leadership was acquired. Fails with `NotLeader` while following and
    /// with `LeaderWait` during the first `2 * ttl` of leadership.
    pub fn expirable(
        &self,
        now: Instant,
        ttl: Duration,
    ) -> Result<Vec<ExpireTarget>, DiscoverdError> {
        let state = self.state.read();
        let since = state.leader_since.ok_or(DiscoverdError::NotLeader)?;
        if now.saturating_duration_since(since) < ttl * 2 {
            return Err(DiscoverdError::LeaderWait);
        }

        let mut targets = vec![];
        for (service, insts) in state.data.instances.iter() {
            for id in insts.keys() {
                let last = state
                    .heartbeats
                    .get(&(service.clone(), id.clone()))
                    .copied()
                    .unwrap_or(since);
                if now.saturating_duration_since(last) > ttl {
                    targets.push(ExpireTarget {
                        service: service.clone(),
                        id: id.clone(),
                    });
                }
            }
        }
        Ok(targets)
    }

    /// Creates a subscription on `service` for events in `kinds`. With
    /// `send_current`, the current state is queued first as `Up`s (by
    /// index), the `Leader`, the `ServiceMeta`, and a final `Current`, each
    /// only if admitted by `kinds`. Nothing can interleave with that
    /// prelude. The channel holds `buffer` events beyond the prelude.
    pub fn subscribe(
        self: &Arc<Self>,
        service: &str,
        send_current: bool,
        kinds: EventKinds,
        buffer: usize,
    ) -> Result<Subscription, DiscoverdError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(DiscoverdError::Shutdown);
        }

        let mut prelude = vec![];
        if send_current {
            if kinds.admits(EventKind::Up) {
                prelude.extend(state.data.sorted_instances(service).into_iter().map(
                    |inst| Event::instance(service, EventKind::Up, Some(inst)),
                ));
            }
            if kinds.admits(EventKind::Leader) {
                if let Some(leader) = state.data.leader(service) {
                    prelude.push(Event::instance(
                        service,
                        EventKind::Leader,
                        Some(leader),
                    ));
                }
            }
            if kinds.admits(EventKind::ServiceMeta) {
                if let Some(meta) = state.data.metas.get(service) {
                    prelude.push(Event::meta(service, meta.clone()));
                }
            }
            if kinds.admits(EventKind::Current) {
                prelude.push(Event::current(service));
            }
        }

        let (sub, rx, err) = Subscriber::new(kinds, buffer + prelude.len());
        for event in prelude.iter() {
            // capacity covers the whole prelude
            sub.offer(event);
        }

        let id = state.next_sub_id;
        state.next_sub_id += 1;
        state
            .subscribers
            .entry(service.into())
            .or_default()
            .insert(id, sub);
        pf_debug!("subscription {} created on {}", id, service);

        Ok(Subscription::new(service, id, rx, err, Arc::downgrade(self)))
    }

    /// Removes a subscription entry, closing its channel.
    pub(crate) fn unsubscribe(&self, service: &str, id: u64) {
        let mut state = self.state.write();
        if let Some(subs) = state.subscribers.get_mut(service) {
            if subs.remove(&id).is_some() {
                pf_trace!("subscription {} on {} detached", id, service);
            }
            if subs.is_empty() {
                state.subscribers.remove(service);
            }
        }
    }

    /// Number of live subscriptions on a service.
    pub fn subscriber_count(&self, service: &str) -> usize {
        self.state
            .read()
            .subscribers
            .get(service)
            .map_or(0, |subs| subs.len())
    }

    /// Closes every subscription cleanly and refuses new ones.
    pub fn close(&self) {
        let mut state = self.state.write();
        state.closed = true;
        state.subscribers.clear();
    }
}

impl Fsm for StateMachine {
    fn apply(&self, index: u64, cmd: &[u8]) -> ApplyResult {
        let mut state = self.state.write();
        let cmd = Command::decode(cmd)?;
        pf_trace!("applying {:?} at {}", cmd, index);

        let mut events = vec![];
        let result = state.apply_cmd(index, cmd, &mut events);
        for event in events {
            state.broadcast(event);
        }
        result
    }

    fn snapshot(&self) -> Result<Vec<u8>, DiscoverdError> {
        let state = self.state.read();
        Ok(rmp_serde::to_vec_named(&state.data)?)
    }

    fn restore(&self, snap: &[u8]) -> Result<(), DiscoverdError> {
        let data: RegistryData = rmp_serde::from_slice(snap)?;
        // subscribers reconverge on their own; no events here
        self.state.write().data = data;
        Ok(())
    }
}
