//! Change events emitted by the store and consumed by subscribers.

use std::fmt;

use crate::model::{Instance, ServiceMeta};

use serde::{Deserialize, Serialize};

/// Kind of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Up,
    Update,
    Down,
    Leader,
    Current,
    ServiceMeta,
}

impl EventKind {
    /// Single-bit mask for this kind.
    pub fn mask(self) -> EventKinds {
        match self {
            EventKind::Up => EventKinds::UP,
            EventKind::Update => EventKinds::UPDATE,
            EventKind::Down => EventKinds::DOWN,
            EventKind::Leader => EventKinds::LEADER,
            EventKind::Current => EventKinds::CURRENT,
            EventKind::ServiceMeta => EventKinds::SERVICE_META,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            EventKind::Up => "up",
            EventKind::Update => "update",
            EventKind::Down => "down",
            EventKind::Leader => "leader",
            EventKind::Current => "current",
            EventKind::ServiceMeta => "service_meta",
        };
        write!(f, "{}", s)
    }
}

bitflags::bitflags! {
    /// Set of event kinds a subscriber is interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventKinds: u32 {
        const UP = 0b0000_0001;
        const UPDATE = 0b0000_0010;
        const DOWN = 0b0000_0100;
        const LEADER = 0b0000_1000;
        const CURRENT = 0b0001_0000;
        const SERVICE_META = 0b0010_0000;

        /// Instance membership changes.
        const INSTANCES = Self::UP.bits() | Self::UPDATE.bits() | Self::DOWN.bits();
    }
}

impl EventKinds {
    /// Whether events of `kind` pass this mask.
    pub fn admits(self, kind: EventKind) -> bool {
        self.contains(kind.mask())
    }
}

impl Default for EventKinds {
    fn default() -> Self {
        Self::all()
    }
}

/// A change to one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub service: String,

    pub kind: EventKind,

    /// Affected instance; the new leader for `Leader` (absent when a
    /// service lost its last instance).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,

    /// New metadata for `ServiceMeta`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_meta: Option<ServiceMeta>,
}

impl Event {
    /// Creates an event about an instance.
    pub fn instance(
        service: &str,
        kind: EventKind,
        instance: Option<Instance>,
    ) -> Self {
        Event {
            service: service.into(),
            kind,
            instance,
            service_meta: None,
        }
    }

    /// Creates a `ServiceMeta` event.
    pub fn meta(service: &str, meta: ServiceMeta) -> Self {
        Event {
            service: service.into(),
            kind: EventKind::ServiceMeta,
            instance: None,
            service_meta: Some(meta),
        }
    }

    /// Creates a `Current` marker.
    pub fn current(service: &str) -> Self {
        Event::instance(service, EventKind::Current, None)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "service={} type={}", self.service, self.kind)?;
        if let Some(inst) = &self.instance {
            write!(f, " id={} addr={}", inst.id, inst.addr)?;
        }
        if let Some(meta) = &self.service_meta {
            write!(f, " meta.index={}", meta.index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod event_tests {
    use super::*;
    use crate::utils::DiscoverdError;
    use std::collections::BTreeMap;

    #[test]
    fn kind_masks() {
        assert!(EventKinds::INSTANCES.admits(EventKind::Update));
        assert!(!EventKinds::INSTANCES.admits(EventKind::Leader));
        assert!(EventKinds::default().admits(EventKind::ServiceMeta));
        let mask = EventKind::Leader.mask() | EventKind::Current.mask();
        assert!(mask.admits(EventKind::Current));
        assert!(!mask.admits(EventKind::Up));
    }

    #[test]
    fn event_json() -> Result<(), DiscoverdError> {
        let inst = Instance::new("10.0.0.1:80", "tcp", BTreeMap::new());
        let ev = Event::instance("web", EventKind::Up, Some(inst));
        let json = serde_json::to_value(&ev)?;
        assert_eq!(json["kind"], "up");
        assert!(json.get("service_meta").is_none());

        let ev = Event::meta("web", ServiceMeta::new(true.into(), 4));
        let text = serde_json::to_string(&ev)?;
        assert!(text.contains("\"kind\":\"service_meta\""));
        assert_eq!(serde_json::from_str::<Event>(&text)?, ev);
        Ok(())
    }

    #[test]
    fn event_display() {
        let ev = Event::current("web");
        assert_eq!(ev.to_string(), "service=web type=current");
    }
}
