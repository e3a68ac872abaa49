//! Seams to the native discovery platform.
//!
//! A [`Platform`] constructs the three native services. Each native service
//! reports back through a delegate trait whose methods map one-to-one onto
//! the platform's callbacks. Natives hold their delegate weakly: once the
//! owning registry entry is gone, callbacks have nowhere to go.

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::PlatformError;
use crate::identity::{DiscoveryInfo, PeerIdentity, ServiceDescriptor};
use crate::session::Session;

/// Continuation a native advertiser hands over with an inbound invitation.
///
/// Called with `true` and a session to accept, `false` and `None` to decline.
pub type InvitationHandler = Box<dyn FnOnce(bool, Option<Session>) + Send>;

/// Byte stream opened by a remote peer.
pub type IncomingStream = Pin<Box<dyn AsyncRead + Send>>;

/// Byte stream opened towards a remote peer.
pub type OutgoingStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Connection state of a peer within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Not (or no longer) connected.
    NotConnected,
    /// Invitation in flight.
    Connecting,
    /// Connected.
    Connected,
}

/// Delivery guarantee for [`NativeSession::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Delivered in order, retransmitted as needed.
    #[default]
    Reliable,
    /// Best effort.
    Unreliable,
}

/// Progress of a resource transfer, shared between platform and consumer.
#[derive(Clone, Default)]
pub struct TransferProgress {
    inner: Arc<ProgressInner>,
}

#[derive(Default)]
struct ProgressInner {
    total: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicBool,
}

impl TransferProgress {
    /// Progress for a transfer of `total` bytes (0 if not yet known).
    pub fn new(total: u64) -> Self {
        let progress = Self::default();
        progress.set_total(total);
        progress
    }

    /// Total bytes, 0 if unknown.
    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Acquire)
    }

    /// Bytes transferred so far.
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Completed fraction in `0.0..=1.0`, 0 while the total is unknown.
    pub fn fraction(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.completed() as f64 / total as f64).min(1.0),
        }
    }

    /// Whether every byte has been transferred.
    pub fn is_finished(&self) -> bool {
        let total = self.total();
        total > 0 && self.completed() >= total
    }

    /// Record the total size.
    pub fn set_total(&self, total: u64) {
        self.inner.total.store(total, Ordering::Release);
    }

    /// Record transferred bytes.
    pub fn set_completed(&self, completed: u64) {
        self.inner.completed.store(completed, Ordering::Release);
    }

    /// Ask the platform to abandon the transfer.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferProgress")
            .field("completed", &self.completed())
            .field("total", &self.total())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Callbacks from a native advertiser.
pub trait AdvertiserDelegate: Send + Sync {
    /// The platform refused to start advertising.
    fn did_not_start_advertising(&self, error: PlatformError);

    /// A remote peer invites us into its session.
    fn did_receive_invitation(
        &self,
        from: PeerIdentity,
        context: Option<Bytes>,
        handler: InvitationHandler,
    );
}

/// Callbacks from a native browser.
pub trait BrowserDelegate: Send + Sync {
    /// The platform refused to start browsing.
    fn did_not_start_browsing(&self, error: PlatformError);

    /// A peer advertising the service was found.
    fn found_peer(&self, peer: PeerIdentity, info: Option<DiscoveryInfo>);

    /// A previously found peer went away.
    fn lost_peer(&self, peer: PeerIdentity);
}

/// Callbacks from a native session.
pub trait SessionDelegate: Send + Sync {
    /// A peer's connection state changed.
    fn peer_did_change_state(&self, peer: PeerIdentity, state: PeerState);

    /// Data arrived from a peer.
    fn did_receive_data(&self, data: Bytes, from: PeerIdentity);

    /// A peer opened a byte stream.
    fn did_receive_stream(&self, stream: IncomingStream, name: String, from: PeerIdentity);

    /// A peer started sending a named resource.
    fn did_start_receiving_resource(
        &self,
        name: String,
        from: PeerIdentity,
        progress: TransferProgress,
    );

    /// A resource transfer finished, successfully or not.
    fn did_finish_receiving_resource(
        &self,
        name: String,
        from: PeerIdentity,
        result: Result<PathBuf, PlatformError>,
    );
}

/// Native "announce presence, receive invitations" service.
pub trait NativeAdvertiser: Send + Sync {
    /// Attach the delegate callbacks are delivered to.
    fn set_delegate(&self, delegate: Weak<dyn AdvertiserDelegate>);

    /// Begin advertising. Failures arrive via the delegate.
    fn start(&self);

    /// Stop advertising.
    fn stop(&self);
}

/// Native "discover peers, send invitations" service.
pub trait NativeBrowser: Send + Sync {
    /// Attach the delegate callbacks are delivered to.
    fn set_delegate(&self, delegate: Weak<dyn BrowserDelegate>);

    /// Begin browsing. Failures arrive via the delegate.
    fn start(&self);

    /// Stop browsing.
    fn stop(&self);

    /// Invite `peer` into `session`. The outcome surfaces as session state changes.
    fn invite(
        &self,
        peer: &PeerIdentity,
        session: &Session,
        context: Option<Bytes>,
        timeout: Duration,
    );
}

/// Native multiway connection.
pub trait NativeSession: Send + Sync {
    /// Attach the delegate callbacks are delivered to.
    fn set_delegate(&self, delegate: Weak<dyn SessionDelegate>);

    /// Send a message to connected peers.
    fn send(
        &self,
        data: Bytes,
        peers: &[PeerIdentity],
        mode: SendMode,
    ) -> Result<(), PlatformError>;

    /// Open a named byte stream to a connected peer.
    fn start_stream(
        &self,
        name: &str,
        peer: &PeerIdentity,
    ) -> Result<OutgoingStream, PlatformError>;

    /// Send a file to a connected peer.
    fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerIdentity,
    ) -> Result<TransferProgress, PlatformError>;

    /// Peers currently connected.
    fn connected_peers(&self) -> Vec<PeerIdentity>;

    /// Leave the session.
    fn disconnect(&self);

    /// Access to the concrete type, for platforms matching their own sessions.
    fn as_any(&self) -> &dyn Any;
}

/// Factory for native services.
pub trait Platform: Send + Sync + 'static {
    /// Construct an advertiser for `local` under `descriptor`.
    fn advertiser(
        &self,
        local: &PeerIdentity,
        descriptor: &ServiceDescriptor,
        info: Option<DiscoveryInfo>,
    ) -> Result<Arc<dyn NativeAdvertiser>, PlatformError>;

    /// Construct a browser for `local` looking for `descriptor`.
    fn browser(
        &self,
        local: &PeerIdentity,
        descriptor: &ServiceDescriptor,
    ) -> Result<Arc<dyn NativeBrowser>, PlatformError>;

    /// Construct a session owned by `local`.
    fn session(&self, local: &PeerIdentity) -> Result<Arc<dyn NativeSession>, PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_tracks_fraction() {
        let progress = TransferProgress::new(0);
        assert_eq!(progress.fraction(), 0.0);
        assert!(!progress.is_finished());

        let shared = progress.clone();
        shared.set_total(200);
        shared.set_completed(50);
        assert_eq!(progress.fraction(), 0.25);

        shared.set_completed(200);
        assert!(progress.is_finished());

        progress.cancel();
        assert!(shared.is_cancelled());
    }
}
