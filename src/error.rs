//! Error types for nearby-bridge.

use std::fmt::Debug;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A live instance already exists for this key and the registry rejects duplicates.
    #[error("a live instance is already registered for key {0}")]
    AlreadyRegistered(String),

    /// No live instance exists for this key.
    #[error("no live instance is registered for key {0}")]
    NotRegistered(String),

    /// The platform could not construct the native service.
    #[error("failed to create native service: {0}")]
    CreationFailed(PlatformError),

    /// The platform refused to begin advertising or browsing.
    #[error("platform refused to start: {0}")]
    StartFailed(PlatformError),

    /// An invitation response was already delivered.
    #[error("invitation from {0} was already answered")]
    InvitationAlreadyAnswered(String),

    /// Accepting an invitation needs a session to bind the connection to.
    #[error("accepting an invitation requires a session")]
    SessionRequired,

    /// The session offered for an invitation was already torn down.
    #[error("session {0} is no longer live")]
    SessionClosed(u64),

    /// Service type failed validation.
    #[error("invalid service type {value:?}: {reason}")]
    InvalidServiceType {
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Peer display name failed validation.
    #[error("invalid peer name {value:?}: {reason}")]
    InvalidPeerName {
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Native platform error.
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl Error {
    /// Create an `AlreadyRegistered` error for a key.
    pub fn already_registered<K: Debug>(key: &K) -> Self {
        Self::AlreadyRegistered(format!("{key:?}"))
    }

    /// Create a `NotRegistered` error for a key.
    pub fn not_registered<K: Debug>(key: &K) -> Self {
        Self::NotRegistered(format!("{key:?}"))
    }
}

/// An error reported by the native discovery platform.
///
/// Mirrors the shape of the errors native frameworks hand to their delegates:
/// an error domain, a numeric code and a human readable description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{domain} ({code}): {message}")]
pub struct PlatformError {
    /// Error domain, e.g. the platform framework name.
    pub domain: String,
    /// Domain specific error code.
    pub code: i64,
    /// Description of the failure.
    pub message: String,
}

impl PlatformError {
    /// Create a platform error.
    pub fn new(domain: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_errors_render_debug_form() {
        let err = Error::already_registered(&"advertiser");
        assert_eq!(err, Error::AlreadyRegistered("\"advertiser\"".into()));
        assert!(err.to_string().contains("\"advertiser\""));

        let err = Error::not_registered(&7u32);
        assert_eq!(err.to_string(), "no live instance is registered for key 7");
    }

    #[test]
    fn platform_error_converts() {
        let platform = PlatformError::new("loopback", 3, "denied");
        let err: Error = platform.clone().into();
        assert_eq!(err, Error::Platform(platform));
        assert_eq!(err.to_string(), "platform error: loopback (3): denied");
    }
}
