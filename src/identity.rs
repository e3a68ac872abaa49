//! Peer identities and service descriptors.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Maximum service type length accepted by local-network service discovery.
pub const MAX_SERVICE_TYPE_LEN: usize = 15;

/// Maximum peer display name length in bytes.
pub const MAX_PEER_NAME_LEN: usize = 63;

/// Key/value pairs an advertiser publishes alongside its presence.
pub type DiscoveryInfo = BTreeMap<String, String>;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique token identifying a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerToken(u64);

impl PeerToken {
    /// Allocate a token never handed out before in this process.
    pub fn fresh() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a token minted by a native platform.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw token value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A peer on the local network.
///
/// Equality, ordering and hashing go through the token only; two identities
/// with the same display name are different peers.
#[derive(Clone)]
pub struct PeerIdentity {
    token: PeerToken,
    display_name: Arc<str>,
}

impl PeerIdentity {
    /// Create a new local identity with a fresh token.
    pub fn new(display_name: impl Into<String>) -> Result<Self> {
        let display_name = display_name.into();
        validate_display_name(&display_name)?;
        Ok(Self::from_parts(PeerToken::fresh(), display_name))
    }

    /// Build an identity from a platform token and name.
    pub fn from_parts(token: PeerToken, display_name: impl Into<Arc<str>>) -> Self {
        Self {
            token,
            display_name: display_name.into(),
        }
    }

    /// The peer's token.
    pub fn token(&self) -> PeerToken {
        self.token
    }

    /// Human readable name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl PartialOrd for PeerIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerIdentity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.token.cmp(&other.token)
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("token", &self.token)
            .field("display_name", &&*self.display_name)
            .finish()
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.display_name, self.token)
    }
}

/// The service an advertiser announces and a browser looks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    service_type: String,
    peer_name: String,
}

impl ServiceDescriptor {
    /// Validate and build a descriptor.
    ///
    /// The service type must be 1-15 ASCII letters, digits or hyphens, contain
    /// at least one letter, and must not start, end or repeat a hyphen. The
    /// peer name must be 1-63 ASCII letters, digits or hyphens.
    pub fn new(service_type: impl Into<String>, peer_name: impl Into<String>) -> Result<Self> {
        let service_type = service_type.into();
        let peer_name = peer_name.into();
        validate_service_type(&service_type)?;
        validate_peer_name(&peer_name)?;
        Ok(Self {
            service_type,
            peer_name,
        })
    }

    /// Build a descriptor whose peer name is `<host>-<suffix>`.
    ///
    /// Characters a peer name cannot carry are replaced with hyphens and the
    /// result is truncated to the maximum peer name length.
    pub fn host_derived(service_type: impl Into<String>, host: &str, suffix: &str) -> Result<Self> {
        let raw = if suffix.is_empty() {
            host.to_string()
        } else {
            format!("{host}-{suffix}")
        };
        let mut peer_name: String = raw
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        peer_name.truncate(MAX_PEER_NAME_LEN);
        Self::new(service_type, peer_name)
    }

    /// The service type string.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// The host derived peer name.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }
}

fn validate_service_type(value: &str) -> Result<()> {
    let invalid = |reason| {
        Err(Error::InvalidServiceType {
            value: value.to_string(),
            reason,
        })
    };
    if value.is_empty() {
        return invalid("must not be empty");
    }
    if value.len() > MAX_SERVICE_TYPE_LEN {
        return invalid("must be at most 15 characters");
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return invalid("may only contain ASCII letters, digits and hyphens");
    }
    if !value.chars().any(|c| c.is_ascii_alphabetic()) {
        return invalid("must contain at least one letter");
    }
    if value.starts_with('-') || value.ends_with('-') {
        return invalid("must not begin or end with a hyphen");
    }
    if value.contains("--") {
        return invalid("must not contain adjacent hyphens");
    }
    Ok(())
}

fn validate_peer_name(value: &str) -> Result<()> {
    validate_display_name(value)?;
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::InvalidPeerName {
            value: value.to_string(),
            reason: "may only contain ASCII letters, digits and hyphens",
        });
    }
    Ok(())
}

fn validate_display_name(value: &str) -> Result<()> {
    let invalid = |reason| {
        Err(Error::InvalidPeerName {
            value: value.to_string(),
            reason,
        })
    };
    if value.is_empty() {
        return invalid("must not be empty");
    }
    if value.len() > MAX_PEER_NAME_LEN {
        return invalid("must be at most 63 bytes");
    }
    Ok(())
}
