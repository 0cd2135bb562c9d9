//! Resumable watch of a service: reconnects on stream loss and reconciles
//! the server's fresh state against a local mirror, so consumers see no gaps
//! and no spurious duplicates across reconnects.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::client::{Client, EventStream};
use crate::model::{Event, EventKind, Instance, ServiceMeta};
use crate::utils::{Attempts, DiscoverdError};

use futures::StreamExt;

use parking_lot::Mutex;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Connection edges reported on a watch's state channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Connected,
    Disconnected,
}

/// Opens a fresh event stream for a watch.
pub type Connector = Box<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<EventStream, DiscoverdError>> + Send>>
        + Send
        + Sync,
>;

/// Local picture of a service as seen through its event stream.
#[derive(Debug, Default)]
pub struct WatchMirror {
    /// Known instances by id.
    instances: BTreeMap<String, Instance>,

    /// Last known service leader.
    leader: Option<Instance>,

    /// Last known service metadata.
    service_meta: Option<ServiceMeta>,

    /// Whether the current connection has delivered its `Current` marker.
    current: bool,

    /// Instance ids announced in the current connection's prelude.
    seen: BTreeSet<String>,
}

impl WatchMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.instances.values().cloned().collect()
    }

    pub fn leader(&self) -> Option<&Instance> {
        self.leader.as_ref()
    }

    pub fn service_meta(&self) -> Option<&ServiceMeta> {
        self.service_meta.as_ref()
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Forgets per-connection state; the mirror itself is kept so the next
    /// prelude can be diffed against it.
    pub fn disconnected(&mut self) {
        self.current = false;
        self.seen.clear();
    }

    /// Applies one inbound event and returns what should be forwarded to
    /// the consumer, in order.
    pub fn reconcile(&mut self, mut event: Event) -> Vec<Event> {
        match event.kind {
            EventKind::Current => {
                let gone: Vec<String> = self
                    .instances
                    .keys()
                    .filter(|id| !self.seen.contains(*id))
                    .cloned()
                    .collect();
                let mut out = Vec::with_capacity(gone.len() + 1);
                for id in gone {
                    if let Some(inst) = self.instances.remove(&id) {
                        out.push(Event::instance(&event.service, EventKind::Down, Some(inst)));
                    }
                }
                self.current = true;
                out.push(event);
                return out;
            }

            EventKind::Up => {
                let Some(inst) = event.instance.clone() else {
                    return vec![event];
                };
                if !self.current {
                    self.seen.insert(inst.id.clone());
                }
                let prev = self.instances.insert(inst.id.clone(), inst.clone());
                if !self.current {
                    match prev {
                        Some(prev) if prev.identical(&inst) => return vec![],
                        Some(_) => event.kind = EventKind::Update,
                        None => {}
                    }
                }
            }

            EventKind::Update => {
                if let Some(inst) = &event.instance {
                    self.instances.insert(inst.id.clone(), inst.clone());
                }
            }

            EventKind::Down => {
                if let Some(inst) = &event.instance {
                    self.instances.remove(&inst.id);
                }
            }

            EventKind::Leader => {
                let same = match (&self.leader, &event.instance) {
                    (Some(known), Some(new)) => known.id == new.id,
                    _ => false,
                };
                if !self.current && same {
                    return vec![];
                }
                self.leader = event.instance.clone();
            }

            EventKind::ServiceMeta => {
                let same = match (&self.service_meta, &event.service_meta) {
                    (Some(known), Some(new)) => known.index == new.index,
                    _ => false,
                };
                if !self.current && same {
                    return vec![];
                }
                self.service_meta = event.service_meta.clone();
            }
        }
        vec![event]
    }
}

/// Consumer handle of a resumable watch.
pub struct Watch {
    /// Reconciled events.
    rx: mpsc::Receiver<Event>,

    /// Error that ended the watch, if any.
    err: Arc<Mutex<Option<DiscoverdError>>>,

    /// Local mirror shared with the watch loop.
    mirror: Arc<Mutex<WatchMirror>>,

    /// Sender side of the termination channel.
    tx_term: watch::Sender<bool>,

    /// Join handle of the watch loop.
    handle: Option<JoinHandle<()>>,
}

impl Watch {
    /// Connects once, failing right away if that does not work, then keeps
    /// the stream alive in a background task. Connection edges go to
    /// `tx_state` if given.
    pub async fn start(
        connector: Connector,
        attempts: Attempts,
        tx_state: Option<mpsc::UnboundedSender<WatchState>>,
    ) -> Result<Self, DiscoverdError> {
        let stream = connector().await?;
        if let Some(tx) = &tx_state {
            let _ = tx.send(WatchState::Connected);
        }

        let (tx, rx) = mpsc::channel(64);
        let err = Arc::new(Mutex::new(None));
        let mirror = Arc::new(Mutex::new(WatchMirror::new()));
        let (tx_term, rx_term) = watch::channel(false);
        let handle = tokio::spawn(Self::watch_task(
            connector,
            attempts,
            stream,
            tx,
            tx_state,
            err.clone(),
            mirror.clone(),
            rx_term,
        ));

        Ok(Watch {
            rx,
            err,
            mirror,
            tx_term,
            handle: Some(handle),
        })
    }

    /// Next reconciled event; `None` once the watch has ended.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Error that ended the watch, `None` while running or after `close()`.
    pub fn err(&self) -> Option<DiscoverdError> {
        self.err.lock().clone()
    }

    /// Instances currently known to the watch.
    pub fn instances(&self) -> Vec<Instance> {
        self.mirror.lock().instances()
    }

    pub fn leader(&self) -> Option<Instance> {
        self.mirror.lock().leader().cloned()
    }

    pub fn service_meta(&self) -> Option<ServiceMeta> {
        self.mirror.lock().service_meta().cloned()
    }

    /// Stops the watch and waits for its task. Idempotent.
    pub async fn close(&mut self) -> Result<(), DiscoverdError> {
        self.tx_term.send_replace(true);
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        self.rx.close();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn watch_task(
        connector: Connector,
        attempts: Attempts,
        mut stream: EventStream,
        tx: mpsc::Sender<Event>,
        tx_state: Option<mpsc::UnboundedSender<WatchState>>,
        err: Arc<Mutex<Option<DiscoverdError>>>,
        mirror: Arc<Mutex<WatchMirror>>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        let send_state = |state| {
            if let Some(tx) = &tx_state {
                let _ = tx.send(state);
            }
        };

        'outer: loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = rx_term.changed() => break,
            };

            match next {
                Some(Ok(event)) => {
                    let out = mirror.lock().reconcile(event);
                    for event in out {
                        tokio::select! {
                            sent = tx.send(event) => if sent.is_err() {
                                break 'outer; // consumer gone
                            },
                            _ = rx_term.changed() => break 'outer,
                        }
                    }
                }

                ended => {
                    if let Some(Err(e)) = ended {
                        pf_debug!("watch stream broke: {}", e);
                    }
                    mirror.lock().disconnected();
                    send_state(WatchState::Disconnected);

                    let reconnect = attempts.run(&connector, |_| true);
                    let result = tokio::select! {
                        result = reconnect => result,
                        _ = rx_term.changed() => break,
                    };
                    match result {
                        Ok(s) => {
                            stream = s;
                            send_state(WatchState::Connected);
                        }
                        Err(e) => {
                            pf_warn!("watch giving up reconnecting: {}", e);
                            *err.lock() = Some(e);
                            break;
                        }
                    }
                }
            }
        }
        pf_debug!("watch task exited");
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.tx_term.send_replace(true);
    }
}

// Client watch API implementation
impl Client {
    /// Resumable watch of all events of a service with the default
    /// reconnect strategy.
    pub async fn watch(&self, service: &str) -> Result<Watch, DiscoverdError> {
        self.watch_with(service, Attempts::RECONNECT, None).await
    }

    /// Resumable watch with an explicit reconnect strategy and optional
    /// state channel.
    pub async fn watch_with(
        &self,
        service: &str,
        attempts: Attempts,
        tx_state: Option<mpsc::UnboundedSender<WatchState>>,
    ) -> Result<Watch, DiscoverdError> {
        let client = self.clone();
        let service = service.to_string();
        let connector: Connector = Box::new(move || {
            let client = client.clone();
            let service = service.clone();
            Box::pin(async move { client.service_events(&service).await })
        });
        Watch::start(connector, attempts, tx_state).await
    }
}
