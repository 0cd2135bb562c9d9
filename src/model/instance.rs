//! Service instance entity and its identity digest.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::utils::DiscoverdError;

use md5::{Digest, Md5};

use serde::{Deserialize, Serialize};

/// Computes the identity of an instance: lowercase hex MD5 of
/// `"<proto>-<addr>"`.
pub fn instance_id(proto: &str, addr: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(proto.as_bytes());
    hasher.update(b"-");
    hasher.update(addr.as_bytes());
    hex::encode(hasher.finalize())
}

/// Splits a `host:port` address, accepting bracketed IPv6 hosts
/// (`[::1]:80`). The port must be a decimal `u16`; the host may be empty.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), DiscoverdError> {
    let invalid =
        || DiscoverdError::Validation(format!("discoverd: invalid addr {:?}", addr));

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
        let port = rest.strip_prefix(':').ok_or_else(invalid)?;
        (host, port)
    } else {
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            // unbracketed IPv6 literal
            return Err(invalid());
        }
        (host, port)
    };

    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

/// A single registered endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Instance {
    /// Hex digest of `"<proto>-<addr>"`.
    #[serde(default)]
    pub id: String,

    /// Endpoint address in `host:port` form.
    #[serde(default)]
    pub addr: String,

    /// Lowercase alphanumeric protocol name, e.g. `tcp` or `http`.
    #[serde(default)]
    pub proto: String,

    /// Free-form string metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    /// Log index of the command that first inserted this instance. Assigned
    /// by the store; preserved across updates.
    #[serde(default)]
    pub index: u64,
}

impl Instance {
    /// Creates a new instance with its `id` computed from `proto` and `addr`.
    pub fn new(
        addr: impl Into<String>,
        proto: impl Into<String>,
        meta: BTreeMap<String, String>,
    ) -> Self {
        let mut inst = Instance {
            id: String::new(),
            addr: addr.into(),
            proto: proto.into(),
            meta,
            index: 0,
        };
        inst.id = inst.expected_id();
        inst
    }

    /// Identity this instance should carry.
    pub fn expected_id(&self) -> String {
        instance_id(&self.proto, &self.addr)
    }

    /// Two instances are identical iff address, proto and meta match.
    /// Registering an identical instance again is just a heartbeat.
    pub fn identical(&self, other: &Instance) -> bool {
        self.addr == other.addr
            && self.proto == other.proto
            && self.meta == other.meta
    }

    /// Checks proto, address shape, and the identity digest.
    pub fn valid(&self) -> Result<(), DiscoverdError> {
        if self.proto.is_empty() {
            return Err(DiscoverdError::Validation(
                "discoverd: proto must be set".into(),
            ));
        }
        if !self
            .proto
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(DiscoverdError::Validation(
                "discoverd: proto must be lowercase alphanumeric".into(),
            ));
        }
        split_host_port(&self.addr)?;

        let expected = self.expected_id();
        if self.id != expected {
            return Err(DiscoverdError::Validation(format!(
                "discoverd: instance id is incorrect, expected {}",
                expected
            )));
        }
        Ok(())
    }

    /// Host part of the address.
    pub fn host(&self) -> &str {
        split_host_port(&self.addr).map_or("", |(h, _)| h)
    }

    /// Port part of the address, `0` if the address is malformed.
    pub fn port(&self) -> u16 {
        split_host_port(&self.addr).map_or(0, |(_, p)| p)
    }

    /// Host parsed as an IP address, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host().parse().ok()
    }
}
