//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for discoverd. Each variant maps onto a stable
/// textual code carried in the HTTP error envelope.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DiscoverdError {
    /// Bad service name, bad instance, invalid leader-type transition.
    Validation(String),

    /// Missing service, instance, or meta.
    ObjectNotFound(String),

    /// Creating an existing service, CAS-create on present meta.
    ObjectExists(String),

    /// Meta CAS-update index mismatch.
    PreconditionFailed(String),

    /// Write attempted on a peer that is not the consensus leader.
    NotLeader,

    /// Write attempted while no leader peer is known.
    NoKnownLeader,

    /// Expiry skipped because leadership is too recent.
    LeaderWait,

    /// Subscription consumer too slow; subscription got closed.
    SendBlocked,

    /// Operation on a closed store, or any request to a peer shutting down.
    Shutdown,

    /// Request body over the accepted size.
    PayloadTooLarge(String),

    /// Operation did not complete within its time bound.
    Timeout(String),

    /// Everything else.
    Unknown(String),
}

impl DiscoverdError {
    /// Creates a generic error from any printable message.
    pub fn msg(msg: impl ToString) -> Self {
        DiscoverdError::Unknown(msg.to_string())
    }

    /// Creates a service-not-found error.
    pub fn service_not_found(service: &str) -> Self {
        DiscoverdError::ObjectNotFound(format!(
            "discoverd: service {:?} not found",
            service
        ))
    }

    /// Creates an instance-not-found error.
    pub fn instance_not_found(service: &str, id: &str) -> Self {
        DiscoverdError::ObjectNotFound(format!(
            "discoverd: instance {}/{} not found",
            service, id
        ))
    }

    /// Creates a service-already-exists error.
    pub fn service_exists(service: &str) -> Self {
        DiscoverdError::ObjectExists(format!(
            "discoverd: service {:?} already exists",
            service
        ))
    }

    /// Stable textual code used in the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::PayloadTooLarge(_) => "validation_error",
            Self::ObjectNotFound(_) => "object_not_found",
            Self::ObjectExists(_) => "object_exists",
            Self::PreconditionFailed(_) => "precondition_failed",
            _ => "unknown_error",
        }
    }

    /// HTTP status code matching this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::ObjectNotFound(_) => 404,
            Self::ObjectExists(_) => 409,
            Self::PreconditionFailed(_) => 412,
            Self::PayloadTooLarge(_) => 413,
            Self::NotLeader => 307,
            Self::NoKnownLeader | Self::Shutdown => 503,
            _ => 500,
        }
    }

    /// Whether a client may retry the request as-is.
    pub fn retry(&self) -> bool {
        matches!(
            self,
            Self::NoKnownLeader | Self::Shutdown | Self::Timeout(_)
        )
    }

    /// Reconstructs a typed error from an HTTP error envelope.
    pub fn from_envelope(status: u16, code: &str, message: String) -> Self {
        match code {
            "validation_error" if status == 413 => Self::PayloadTooLarge(message),
            "validation_error" => Self::Validation(message),
            "object_not_found" => Self::ObjectNotFound(message),
            "object_exists" => Self::ObjectExists(message),
            "precondition_failed" => Self::PreconditionFailed(message),
            _ if status == 503 && message == Self::Shutdown.to_string() => {
                Self::Shutdown
            }
            _ if status == 503 => Self::NoKnownLeader,
            _ => Self::Unknown(message),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_))
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, Self::ObjectExists(_))
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl fmt::Display for DiscoverdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Validation(m)
            | Self::ObjectNotFound(m)
            | Self::ObjectExists(m)
            | Self::PreconditionFailed(m)
            | Self::PayloadTooLarge(m)
            | Self::Timeout(m)
            | Self::Unknown(m) => write!(f, "{}", m),
            Self::NotLeader => write!(f, "discoverd: not leader"),
            Self::NoKnownLeader => write!(f, "discoverd: no known leader"),
            Self::LeaderWait => {
                write!(f, "discoverd: waiting for leadership to settle")
            }
            Self::SendBlocked => write!(
                f,
                "discoverd: channel send failed due to blocked receiver"
            ),
            Self::Shutdown => write!(f, "discoverd: shutting down"),
        }
    }
}

impl error::Error for DiscoverdError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `DiscoverdError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for DiscoverdError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                DiscoverdError::Unknown(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `DiscoverdError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for DiscoverdError {
            fn from(e: $error) -> DiscoverdError {
                DiscoverdError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(serde_json::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(http::Error);
impl_from_error!(http::uri::InvalidUri);
impl_from_error!(hyper::Error);
impl_from_error!(hyper_util::client::legacy::Error);
impl_from_error!(hickory_proto::error::ProtoError);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::sync::watch::error::RecvError);

impl From<tokio::time::error::Elapsed> for DiscoverdError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        DiscoverdError::Timeout(e.to_string())
    }
}

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = DiscoverdError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        assert_eq!(
            format!("{}", DiscoverdError::service_not_found("a")),
            "discoverd: service \"a\" not found"
        );
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = DiscoverdError::from(io_error);
        assert!(e.to_string().contains("oh no!"));
        assert_eq!(e.code(), "unknown_error");
    }

    #[test]
    fn codes_and_statuses() {
        let cases = [
            (DiscoverdError::Validation("x".into()), "validation_error", 400),
            (DiscoverdError::ObjectNotFound("x".into()), "object_not_found", 404),
            (DiscoverdError::ObjectExists("x".into()), "object_exists", 409),
            (
                DiscoverdError::PreconditionFailed("x".into()),
                "precondition_failed",
                412,
            ),
            (DiscoverdError::PayloadTooLarge("x".into()), "validation_error", 413),
            (DiscoverdError::NoKnownLeader, "unknown_error", 503),
            (DiscoverdError::Shutdown, "unknown_error", 503),
            (DiscoverdError::msg("x"), "unknown_error", 500),
        ];
        for (e, code, status) in cases {
            assert_eq!(e.code(), code);
            assert_eq!(e.http_status(), status);
        }
    }

    #[test]
    fn envelope_round_back() {
        for e in [
            DiscoverdError::Validation("bad".into()),
            DiscoverdError::ObjectNotFound("gone".into()),
            DiscoverdError::ObjectExists("dup".into()),
            DiscoverdError::PreconditionFailed("stale".into()),
            DiscoverdError::PayloadTooLarge("big".into()),
            DiscoverdError::Shutdown,
        ] {
            let back = DiscoverdError::from_envelope(
                e.http_status(),
                e.code(),
                e.to_string(),
            );
            assert_eq!(back, e);
        }
        assert_eq!(
            DiscoverdError::from_envelope(503, "unknown_error", "".into()),
            DiscoverdError::NoKnownLeader
        );
    }
}
