//! Per-service event subscriptions with drop-on-block delivery.

use std::sync::{Arc, Weak};

use crate::model::{Event, EventKinds};
use crate::server::StateMachine;
use crate::utils::DiscoverdError;

use parking_lot::Mutex;

use tokio::sync::mpsc::{self, error::TrySendError};

/// Error slot shared between a subscription handle and its registry entry.
pub(crate) type ErrSlot = Arc<Mutex<Option<DiscoverdError>>>;

/// Outcome of offering one event to a subscriber.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Enqueued, or filtered out by the kind mask.
    Kept,

    /// Consumer too slow; entry must be dropped.
    Blocked,

    /// Receiver already gone; entry must be dropped.
    Gone,
}

/// Registry-side half of a subscription, kept in the state machine's
/// per-service subscriber map.
pub(crate) struct Subscriber {
    /// Event kinds this subscriber wants.
    kinds: EventKinds,

    /// Bounded sender; dropping it closes the consumer's channel.
    tx: mpsc::Sender<Event>,

    /// Error reported to the consumer once the channel is drained.
    err: ErrSlot,
}

impl Subscriber {
    /// Creates a subscriber entry and its consumer-side parts.
    pub(crate) fn new(
        kinds: EventKinds,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Event>, ErrSlot) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let err = Arc::new(Mutex::new(None));
        (
            Subscriber {
                kinds,
                tx,
                err: err.clone(),
            },
            rx,
            err,
        )
    }

    /// Whether this subscriber wants `event` at all.
    pub(crate) fn admits(&self, event: &Event) -> bool {
        self.kinds.admits(event.kind)
    }

    /// Offers an event without ever waiting. A full channel marks the
    /// subscription errored with `SendBlocked`.
    pub(crate) fn offer(&self, event: &Event) -> Delivery {
        if !self.admits(event) {
            return Delivery::Kept;
        }
        match self.tx.try_send(event.clone()) {
            Ok(()) => Delivery::Kept,
            Err(TrySendError::Full(_)) => {
                *self.err.lock() = Some(DiscoverdError::SendBlocked);
                Delivery::Blocked
            }
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }
}

/// Consumer handle of a subscription. Events arrive in apply order; the
/// stream ends when the subscription is closed by either side. Dropping the
/// handle detaches it from the registry.
pub struct Subscription {
    /// Service subscribed to.
    service: String,

    /// Key of the registry entry.
    id: u64,

    /// Receiver side of the event channel.
    rx: mpsc::Receiver<Event>,

    /// Error set by the registry if this subscription was cut off.
    err: ErrSlot,

    /// Registry to detach from on close.
    registry: Weak<StateMachine>,
}

impl Subscription {
    pub(crate) fn new(
        service: &str,
        id: u64,
        rx: mpsc::Receiver<Event>,
        err: ErrSlot,
        registry: Weak<StateMachine>,
    ) -> Self {
        Subscription {
            service: service.into(),
            id,
            rx,
            err,
            registry,
        }
    }

    /// Service name this subscription watches.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Waits for the next event. `None` once the subscription is closed and
    /// all buffered events were consumed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Takes a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Error that closed this subscription, `None` for a clean close.
    pub fn err(&self) -> Option<DiscoverdError> {
        self.err.lock().clone()
    }

    /// Detaches from the registry and discards anything still buffered.
    pub fn close(&mut self) {
        self.detach();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    fn detach(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.service, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
