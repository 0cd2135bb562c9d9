//! Replicated commands: every mutation of the registry goes through the log
//! as one tag byte followed by a MessagePack body.

use crate::model::{Instance, ServiceConfig, ServiceMeta};
use crate::utils::DiscoverdError;

use serde::{Deserialize, Serialize};

/// Command tag bytes. Stable across versions since they live in the log.
pub const TAG_ADD_SERVICE: u8 = 0;
pub const TAG_REMOVE_SERVICE: u8 = 1;
pub const TAG_SET_SERVICE_META: u8 = 2;
pub const TAG_SET_LEADER: u8 = 3;
pub const TAG_ADD_INSTANCE: u8 = 4;
pub const TAG_REMOVE_INSTANCE: u8 = 5;
pub const TAG_EXPIRE_INSTANCES: u8 = 6;

/// `(service, instance id)` pair targeted by an expiry.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ExpireTarget {
    pub service: String,
    pub id: String,
}

/// Command to the registry state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    AddService {
        service: String,
        config: ServiceConfig,
    },

    RemoveService {
        service: String,
    },

    /// CAS write of service metadata, optionally installing a leader.
    SetServiceMeta {
        service: String,
        meta: ServiceMeta,
    },

    SetLeader {
        service: String,
        id: String,
    },

    AddInstance {
        service: String,
        instance: Instance,
    },

    RemoveInstance {
        service: String,
        id: String,
    },

    /// Batch removal issued by the leader's expirer.
    ExpireInstances {
        instances: Vec<ExpireTarget>,
    },
}

// bodies are encoded separately from the tag so that the tag byte alone
// identifies the command kind on the wire
#[derive(Serialize, Deserialize)]
struct ServiceBody {
    service: String,
    #[serde(default)]
    config: ServiceConfig,
}

#[derive(Serialize, Deserialize)]
struct MetaBody {
    service: String,
    meta: ServiceMeta,
}

#[derive(Serialize, Deserialize)]
struct IdBody {
    service: String,
    id: String,
}

#[derive(Serialize, Deserialize)]
struct InstanceBody {
    service: String,
    instance: Instance,
}

#[derive(Serialize, Deserialize)]
struct ExpireBody {
    instances: Vec<ExpireTarget>,
}

fn with_tag<T: Serialize>(
    tag: u8,
    body: &T,
) -> Result<Vec<u8>, DiscoverdError> {
    let mut buf = vec![tag];
    rmp_serde::encode::write_named(&mut buf, body)?;
    Ok(buf)
}

impl Command {
    /// Tag byte of this command.
    pub fn tag(&self) -> u8 {
        match self {
            Command::AddService { .. } => TAG_ADD_SERVICE,
            Command::RemoveService { .. } => TAG_REMOVE_SERVICE,
            Command::SetServiceMeta { .. } => TAG_SET_SERVICE_META,
            Command::SetLeader { .. } => TAG_SET_LEADER,
            Command::AddInstance { .. } => TAG_ADD_INSTANCE,
            Command::RemoveInstance { .. } => TAG_REMOVE_INSTANCE,
            Command::ExpireInstances { .. } => TAG_EXPIRE_INSTANCES,
        }
    }

    /// Encodes into `tag ++ body`. Deterministic: equal commands always give
    /// equal bytes.
    pub fn encode(&self) -> Result<Vec<u8>, DiscoverdError> {
        let tag = self.tag();
        match self.clone() {
            Command::AddService { service, config } => {
                with_tag(tag, &ServiceBody { service, config })
            }
            Command::RemoveService { service } => with_tag(
                tag,
                &ServiceBody {
                    service,
                    config: ServiceConfig::default(),
                },
            ),
            Command::SetServiceMeta { service, meta } => {
                with_tag(tag, &MetaBody { service, meta })
            }
            Command::SetLeader { service, id }
            | Command::RemoveInstance { service, id } => {
                with_tag(tag, &IdBody { service, id })
            }
            Command::AddInstance { service, instance } => {
                with_tag(tag, &InstanceBody { service, instance })
            }
            Command::ExpireInstances { instances } => {
                with_tag(tag, &ExpireBody { instances })
            }
        }
    }

    /// Decodes from `tag ++ body`.
    pub fn decode(buf: &[u8]) -> Result<Self, DiscoverdError> {
        let (&tag, body) = buf.split_first().ok_or_else(|| {
            DiscoverdError::msg("discoverd: empty command payload")
        })?;

        let cmd = match tag {
            TAG_ADD_SERVICE => {
                let b: ServiceBody = rmp_serde::from_slice(body)?;
                Command::AddService {
                    service: b.service,
                    config: b.config,
                }
            }
            TAG_REMOVE_SERVICE => {
                let b: ServiceBody = rmp_serde::from_slice(body)?;
                Command::RemoveService { service: b.service }
            }
            TAG_SET_SERVICE_META => {
                let b: MetaBody = rmp_serde::from_slice(body)?;
                Command::SetServiceMeta {
                    service: b.service,
                    meta: b.meta,
                }
            }
            TAG_SET_LEADER => {
                let b: IdBody = rmp_serde::from_slice(body)?;
                Command::SetLeader {
                    service: b.service,
                    id: b.id,
                }
            }
            TAG_ADD_INSTANCE => {
                let b: InstanceBody = rmp_serde::from_slice(body)?;
                Command::AddInstance {
                    service: b.service,
                    instance: b.instance,
                }
            }
            TAG_REMOVE_INSTANCE => {
                let b: IdBody = rmp_serde::from_slice(body)?;
                Command::RemoveInstance {
                    service: b.service,
                    id: b.id,
                }
            }
            TAG_EXPIRE_INSTANCES => {
                let b: ExpireBody = rmp_serde::from_slice(body)?;
                Command::ExpireInstances {
                    instances: b.instances,
                }
            }
            _ => {
                return Err(DiscoverdError::msg(format!(
                    "discoverd: unknown command type {}",
                    tag
                )))
            }
        };
        Ok(cmd)
    }
}
