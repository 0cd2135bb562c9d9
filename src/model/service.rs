//! Service-level configuration and metadata.

use crate::utils::DiscoverdError;

use serde::{Deserialize, Serialize};

/// Checks that a service name is non-empty and matches `[a-z0-9-]+`.
pub fn valid_service_name(service: &str) -> Result<(), DiscoverdError> {
    if service.is_empty() {
        return Err(DiscoverdError::Validation(
            "discoverd: service name must not be empty".into(),
        ));
    }
    if !service
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(DiscoverdError::Validation(
            "discoverd: service must be lowercase alphanumeric plus dash"
                .into(),
        ));
    }
    Ok(())
}

/// How the leader of a service is chosen.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LeaderType {
    /// Live instance with the smallest index.
    #[default]
    Oldest,

    /// Set explicitly through `SetLeader` or a meta write.
    Manual,
}

/// Per-service configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub struct ServiceConfig {
    #[serde(default)]
    pub leader_type: LeaderType,
}

impl ServiceConfig {
    pub fn manual() -> Self {
        ServiceConfig {
            leader_type: LeaderType::Manual,
        }
    }
}

/// Opaque JSON metadata attached to a service, guarded by a CAS index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceMeta {
    /// Arbitrary JSON document.
    #[serde(default)]
    pub data: serde_json::Value,

    /// On write: `0` to create, the current index to update. On read: log
    /// index of the command that last set it.
    #[serde(default)]
    pub index: u64,

    /// Optional manual leader installed atomically with this write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
}

impl ServiceMeta {
    pub fn new(data: serde_json::Value, index: u64) -> Self {
        ServiceMeta {
            data,
            index,
            leader_id: None,
        }
    }
}
