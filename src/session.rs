//! Session service: accepted connections and data exchange.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{self, EventSink, EventStream};
use crate::error::PlatformError;
use crate::identity::PeerIdentity;
use crate::native::{
    IncomingStream, NativeSession, OutgoingStream, PeerState, Platform, SendMode,
    SessionDelegate, TransferProgress,
};
use crate::registry::{DuplicatePolicy, RegistryKey, ServiceRegistry};
use crate::{Error, Result};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Registry type for session instances.
pub type SessionRegistry<K> = ServiceRegistry<K, SessionBundle>;

/// An established multiway connection.
///
/// Cheap to clone. The reducer keeps clones to offer the session in
/// invitations; the session service keeps one for sending and teardown.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    local: PeerIdentity,
    native: Arc<dyn NativeSession>,
    live: CancellationToken,
}

impl Session {
    fn new(local: PeerIdentity, native: Arc<dyn NativeSession>, live: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
                local,
                native,
                live,
            }),
        }
    }

    /// Process-unique id of this session.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The identity this session was created for.
    pub fn local_peer(&self) -> &PeerIdentity {
        &self.inner.local
    }

    /// The platform's session object.
    pub fn native(&self) -> &dyn NativeSession {
        self.inner.native.as_ref()
    }

    /// Whether the owning registry entry is still alive.
    pub fn is_live(&self) -> bool {
        !self.inner.live.is_cancelled()
    }

    /// Peers currently connected.
    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.inner.native.connected_peers()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Events emitted by a session instance.
///
/// [`SessionEvent::Created`] is always the first event of a successfully
/// created session.
pub enum SessionEvent {
    /// The session is usable.
    Created(Session),
    /// The session could not be created; the stream ends after this.
    CreationFailed(Error),
    /// A peer's connection state changed.
    PeerStateChanged(PeerIdentity, PeerState),
    /// A message arrived.
    DataReceived(PeerIdentity, Bytes),
    /// A peer opened a byte stream.
    StreamReceived {
        /// Sender.
        peer: PeerIdentity,
        /// Stream name chosen by the sender.
        name: String,
        /// Readable half.
        stream: IncomingStream,
    },
    /// A resource transfer began.
    ResourceTransferStarted {
        /// Sender.
        peer: PeerIdentity,
        /// Resource name.
        name: String,
        /// Live progress.
        progress: TransferProgress,
    },
    /// A resource transfer ended.
    ResourceTransferFinished {
        /// Sender.
        peer: PeerIdentity,
        /// Resource name.
        name: String,
        /// Local file location, or why the transfer failed.
        result: std::result::Result<PathBuf, PlatformError>,
    },
    /// A fire-and-forget send was refused by the platform.
    SendFailed(Error),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created(session) => f.debug_tuple("Created").field(session).finish(),
            Self::CreationFailed(error) => f.debug_tuple("CreationFailed").field(error).finish(),
            Self::PeerStateChanged(peer, state) => f
                .debug_tuple("PeerStateChanged")
                .field(peer)
                .field(state)
                .finish(),
            Self::DataReceived(peer, data) => f
                .debug_tuple("DataReceived")
                .field(peer)
                .field(&data.len())
                .finish(),
            Self::StreamReceived { peer, name, .. } => f
                .debug_struct("StreamReceived")
                .field("peer", peer)
                .field("name", name)
                .finish_non_exhaustive(),
            Self::ResourceTransferStarted {
                peer,
                name,
                progress,
            } => f
                .debug_struct("ResourceTransferStarted")
                .field("peer", peer)
                .field("name", name)
                .field("progress", progress)
                .finish(),
            Self::ResourceTransferFinished { peer, name, result } => f
                .debug_struct("ResourceTransferFinished")
                .field("peer", peer)
                .field("name", name)
                .field("result", result)
                .finish(),
            Self::SendFailed(error) => f.debug_tuple("SendFailed").field(error).finish(),
        }
    }
}

struct SessionAdapter {
    sink: EventSink<SessionEvent>,
}

impl SessionDelegate for SessionAdapter {
    fn peer_did_change_state(&self, peer: PeerIdentity, state: PeerState) {
        self.sink.send(SessionEvent::PeerStateChanged(peer, state));
    }

    fn did_receive_data(&self, data: Bytes, from: PeerIdentity) {
        self.sink.send(SessionEvent::DataReceived(from, data));
    }

    fn did_receive_stream(&self, stream: IncomingStream, name: String, from: PeerIdentity) {
        self.sink.send(SessionEvent::StreamReceived {
            peer: from,
            name,
            stream,
        });
    }

    fn did_start_receiving_resource(
        &self,
        name: String,
        from: PeerIdentity,
        progress: TransferProgress,
    ) {
        self.sink.send(SessionEvent::ResourceTransferStarted {
            peer: from,
            name,
            progress,
        });
    }

    fn did_finish_receiving_resource(
        &self,
        name: String,
        from: PeerIdentity,
        result: std::result::Result<PathBuf, PlatformError>,
    ) {
        self.sink.send(SessionEvent::ResourceTransferFinished {
            peer: from,
            name,
            result,
        });
    }
}

/// Resources owned by one live session entry.
pub struct SessionBundle {
    session: Session,
    delegate: Arc<SessionAdapter>,
}

impl SessionBundle {
    /// The session held by this entry.
    pub fn session(&self) -> &Session {
        &self.session
    }

    fn shutdown(&self) {
        self.session.inner.live.cancel();
        self.session.native().disconnect();
    }
}

/// Creates sessions and routes data through them by key.
#[derive(Clone)]
pub struct SessionService<K: RegistryKey> {
    platform: Arc<dyn Platform>,
    registry: Arc<SessionRegistry<K>>,
}

impl<K: RegistryKey> SessionService<K> {
    /// Create a service over an injected registry.
    pub fn new(platform: Arc<dyn Platform>, registry: Arc<SessionRegistry<K>>) -> Self {
        Self { platform, registry }
    }

    /// Create a service with its own registry.
    pub fn with_policy(platform: Arc<dyn Platform>, policy: DuplicatePolicy) -> Self {
        Self::new(platform, Arc::new(ServiceRegistry::new(policy)))
    }

    /// The registry backing this service.
    pub fn registry(&self) -> &Arc<SessionRegistry<K>> {
        &self.registry
    }

    /// Create a session for `local` under `key`.
    ///
    /// The returned stream yields [`SessionEvent::Created`] first, then the
    /// session's callbacks in arrival order until cancelled.
    pub fn create(&self, key: K, local: PeerIdentity) -> EventStream<SessionEvent> {
        debug!(key = ?key, peer = %local, "creating session");
        let (sink, stream) = bridge::channel();

        let native = match self.platform.session(&local) {
            Ok(native) => native,
            Err(error) => {
                warn!(key = ?key, %error, "platform failed to create session");
                sink.send(SessionEvent::CreationFailed(Error::CreationFailed(error)));
                return stream;
            }
        };

        let session = Session::new(local, Arc::clone(&native), sink.cancellation_token());
        let bundle = Arc::new(SessionBundle {
            session: session.clone(),
            delegate: Arc::new(SessionAdapter { sink: sink.clone() }),
        });

        let registration = match self.registry.register(key.clone(), Arc::clone(&bundle)) {
            Ok(registration) => registration,
            Err(error) => {
                warn!(key = ?key, %error, "session not registered");
                sink.send(SessionEvent::CreationFailed(error));
                return stream;
            }
        };
        if let Some(previous) = registration.replaced {
            previous.shutdown();
        }

        // Created is queued before the delegate is attached, so it is first.
        sink.send(SessionEvent::Created(session));
        let delegate: Arc<dyn SessionDelegate> = bundle.delegate.clone();
        native.set_delegate(Arc::downgrade(&delegate));

        let registry = Arc::clone(&self.registry);
        let instance = registration.instance;
        stream.cancel_handle().on_cancel(move || {
            debug!(key = ?key, "deleting session dependencies");
            if let Some(bundle) = registry.remove_instance(&key, instance) {
                bundle.shutdown();
            }
        });
        stream
    }

    /// The live session under `key`.
    pub fn session(&self, key: &K) -> Option<Session> {
        self.registry
            .lookup(key)
            .ok()
            .map(|bundle| bundle.session.clone())
    }

    /// Whether a session is registered under `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.registry.contains(key)
    }

    /// Send `data` to `peers`. Platform refusals surface as [`SessionEvent::SendFailed`].
    pub fn send(&self, key: &K, data: Bytes, peers: &[PeerIdentity], mode: SendMode) {
        let Ok(bundle) = self.registry.lookup(key) else {
            debug!(key = ?key, "send on unregistered session ignored");
            return;
        };
        if let Err(error) = bundle.session.native().send(data, peers, mode) {
            warn!(key = ?key, %error, "send failed");
            bundle
                .delegate
                .sink
                .send(SessionEvent::SendFailed(Error::Platform(error)));
        }
    }

    /// Open a named byte stream to a connected peer.
    ///
    /// Unlike the fire-and-forget commands this returns the stream, so lookup
    /// misses and platform refusals are reported to the caller.
    pub fn start_stream(
        &self,
        key: &K,
        name: &str,
        peer: &PeerIdentity,
    ) -> Result<OutgoingStream> {
        let bundle = self.registry.lookup(key)?;
        debug!(key = ?key, %peer, name, "starting stream");
        Ok(bundle.session.native().start_stream(name, peer)?)
    }

    /// Send a file to a connected peer.
    pub fn send_resource(
        &self,
        key: &K,
        path: &Path,
        name: &str,
        peer: &PeerIdentity,
    ) -> Result<TransferProgress> {
        let bundle = self.registry.lookup(key)?;
        debug!(key = ?key, %peer, name, "sending resource");
        Ok(bundle.session.native().send_resource(path, name, peer)?)
    }

    /// Peers connected to the session under `key`; empty if none is registered.
    pub fn connected_peers(&self, key: &K) -> Vec<PeerIdentity> {
        self.registry
            .lookup(key)
            .map(|bundle| bundle.session.connected_peers())
            .unwrap_or_default()
    }

    /// Disconnect from all peers. The session stays registered.
    pub fn disconnect(&self, key: &K) {
        match self.registry.lookup(key) {
            Ok(bundle) => {
                debug!(key = ?key, "disconnecting session");
                bundle.session.native().disconnect();
            }
            Err(_) => debug!(key = ?key, "disconnect on unregistered session ignored"),
        }
    }
}

impl<K: RegistryKey> fmt::Debug for SessionService<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionService")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
