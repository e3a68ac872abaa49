//! Browser service: discover peers, send invitations.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{self, EventSink, EventStream};
use crate::error::PlatformError;
use crate::identity::{DiscoveryInfo, PeerIdentity, ServiceDescriptor};
use crate::native::{BrowserDelegate, NativeBrowser, Platform};
use crate::registry::{DuplicatePolicy, RegistryKey, ServiceRegistry};
use crate::session::SessionRegistry;
use crate::Error;

/// Registry type for browser instances.
pub type BrowserRegistry<K> = ServiceRegistry<K, BrowserBundle>;

/// Events emitted by a browser instance.
///
/// Discoveries are passed through as the platform reports them; a peer that
/// re-announces itself is found again.
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserEvent {
    /// The browser could not be created; the stream ends after this.
    CreationFailed(Error),
    /// The platform refused to start browsing. The browser stays idle.
    FailedToStart(Error),
    /// A peer advertising the service was found.
    FoundPeer(PeerIdentity, Option<DiscoveryInfo>),
    /// A previously found peer went away.
    LostPeer(PeerIdentity),
}

struct BrowserAdapter {
    sink: EventSink<BrowserEvent>,
    browsing: Arc<AtomicBool>,
}

impl BrowserDelegate for BrowserAdapter {
    fn did_not_start_browsing(&self, error: PlatformError) {
        self.browsing.store(false, Ordering::Release);
        let error = Error::StartFailed(error);
        self.sink.send(BrowserEvent::FailedToStart(error));
    }

    fn found_peer(&self, peer: PeerIdentity, info: Option<DiscoveryInfo>) {
        self.sink.send(BrowserEvent::FoundPeer(peer, info));
    }

    fn lost_peer(&self, peer: PeerIdentity) {
        self.sink.send(BrowserEvent::LostPeer(peer));
    }
}

/// Resources owned by one live browser entry.
pub struct BrowserBundle {
    native: Arc<dyn NativeBrowser>,
    delegate: Arc<BrowserAdapter>,
    browsing: Arc<AtomicBool>,
    token: CancellationToken,
}

impl BrowserBundle {
    /// Whether the platform is (believed to be) browsing.
    pub fn is_browsing(&self) -> bool {
        self.browsing.load(Ordering::Acquire)
    }

    fn start(&self) {
        if self.token.is_cancelled() {
            return;
        }
        if !self.browsing.swap(true, Ordering::AcqRel) {
            self.native.start();
            // A shutdown racing the start above may have missed it.
            if self.token.is_cancelled() {
                self.stop();
            }
        }
    }

    fn stop(&self) {
        if self.browsing.swap(false, Ordering::AcqRel) {
            self.native.stop();
        }
    }

    fn shutdown(&self) {
        self.token.cancel();
        self.stop();
    }
}

/// Owns browser instances by key.
///
/// Invitations offer a session by its key in the shared session registry, so
/// only sessions that were successfully created and not yet cancelled can be
/// offered.
#[derive(Clone)]
pub struct BrowserService<K: RegistryKey> {
    platform: Arc<dyn Platform>,
    registry: Arc<BrowserRegistry<K>>,
    sessions: Arc<SessionRegistry<K>>,
}

impl<K: RegistryKey> BrowserService<K> {
    /// Create a service over injected browser and session registries.
    pub fn new(
        platform: Arc<dyn Platform>,
        registry: Arc<BrowserRegistry<K>>,
        sessions: Arc<SessionRegistry<K>>,
    ) -> Self {
        Self {
            platform,
            registry,
            sessions,
        }
    }

    /// Create a service with its own browser registry.
    pub fn with_policy(
        platform: Arc<dyn Platform>,
        policy: DuplicatePolicy,
        sessions: Arc<SessionRegistry<K>>,
    ) -> Self {
        Self::new(platform, Arc::new(ServiceRegistry::new(policy)), sessions)
    }

    /// The registry backing this service.
    pub fn registry(&self) -> &Arc<BrowserRegistry<K>> {
        &self.registry
    }

    /// Create an idle browser for `local` under `key`.
    pub fn create(
        &self,
        key: K,
        local: PeerIdentity,
        descriptor: ServiceDescriptor,
    ) -> EventStream<BrowserEvent> {
        debug!(
            key = ?key,
            peer = %local,
            service_type = descriptor.service_type(),
            "creating browser"
        );
        let (sink, stream) = bridge::channel();

        let native = match self.platform.browser(&local, &descriptor) {
            Ok(native) => native,
            Err(error) => {
                warn!(key = ?key, %error, "platform failed to create browser");
                sink.send(BrowserEvent::CreationFailed(Error::CreationFailed(error)));
                return stream;
            }
        };

        let browsing = Arc::new(AtomicBool::new(false));
        let bundle = Arc::new(BrowserBundle {
            native: Arc::clone(&native),
            delegate: Arc::new(BrowserAdapter {
                sink: sink.clone(),
                browsing: Arc::clone(&browsing),
            }),
            browsing,
            token: sink.cancellation_token(),
        });

        let registration = match self.registry.register(key.clone(), Arc::clone(&bundle)) {
            Ok(registration) => registration,
            Err(error) => {
                warn!(key = ?key, %error, "browser not registered");
                sink.send(BrowserEvent::CreationFailed(error));
                return stream;
            }
        };
        if let Some(previous) = registration.replaced {
            previous.shutdown();
        }

        let delegate: Arc<dyn BrowserDelegate> = bundle.delegate.clone();
        native.set_delegate(Arc::downgrade(&delegate));

        let registry = Arc::clone(&self.registry);
        let instance = registration.instance;
        stream.cancel_handle().on_cancel(move || {
            debug!(key = ?key, "deleting browser dependencies");
            if let Some(bundle) = registry.remove_instance(&key, instance) {
                bundle.shutdown();
            }
        });
        stream
    }

    /// Start browsing. No-op if nothing is registered under `key` or it is
    /// already browsing.
    pub fn start_browsing(&self, key: &K) {
        match self.registry.lookup(key) {
            Ok(bundle) => {
                debug!(key = ?key, "start browsing");
                bundle.start();
            }
            Err(_) => debug!(key = ?key, "start browsing on unregistered key ignored"),
        }
    }

    /// Stop browsing. No-op if nothing is registered under `key`.
    pub fn stop_browsing(&self, key: &K) {
        match self.registry.lookup(key) {
            Ok(bundle) => {
                debug!(key = ?key, "stop browsing");
                bundle.stop();
            }
            Err(_) => debug!(key = ?key, "stop browsing on unregistered key ignored"),
        }
    }

    /// Invite `peer` into the session registered under `session_key`.
    ///
    /// Fire-and-forget: the outcome (accepted, declined, timed out) arrives as
    /// [`PeerStateChanged`](crate::session::SessionEvent::PeerStateChanged)
    /// on that session's stream. No-op if either key is not registered.
    pub fn invite_peer(
        &self,
        key: &K,
        peer: &PeerIdentity,
        session_key: &K,
        context: Option<Bytes>,
        timeout: Duration,
    ) {
        let Ok(bundle) = self.registry.lookup(key) else {
            debug!(key = ?key, %peer, "invite on unregistered browser ignored");
            return;
        };
        let Ok(offered) = self.sessions.lookup(session_key) else {
            debug!(
                key = ?key,
                session_key = ?session_key,
                %peer,
                "invite to unregistered session ignored"
            );
            return;
        };
        let session = offered.session();
        debug!(key = ?key, %peer, session = session.id(), ?timeout, "sending invitation");
        bundle.native.invite(peer, session, context, timeout);
    }

    /// Whether the browser under `key` is browsing.
    pub fn is_browsing(&self, key: &K) -> bool {
        self.registry
            .lookup(key)
            .map(|bundle| bundle.is_browsing())
            .unwrap_or(false)
    }

    /// Whether a browser is registered under `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.registry.contains(key)
    }
}

impl<K: RegistryKey> fmt::Debug for BrowserService<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserService")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::loopback::LoopbackNetwork;

    fn browsers(network: &LoopbackNetwork) -> BrowserService<u32> {
        BrowserService::with_policy(
            Arc::new(network.clone()),
            DuplicatePolicy::Replace,
            Arc::new(ServiceRegistry::new(DuplicatePolicy::Reject)),
        )
    }

    #[tokio::test]
    async fn replace_ends_previous_stream() {
        let network = LoopbackNetwork::new();
        let service = browsers(&network);
        let local = PeerIdentity::new("host-dev").unwrap();
        let descriptor = ServiceDescriptor::new("svc", "host-dev").unwrap();

        let mut first = service.create(1, local.clone(), descriptor.clone());
        service.start_browsing(&1);
        let _second = service.create(1, local, descriptor);

        assert!(first.is_cancelled());
        assert!(first.next().await.is_none());
        assert!(service.contains(&1));
        assert!(!service.is_browsing(&1));

        // The stale stream's teardown must leave the replacement alone.
        drop(first);
        assert!(service.contains(&1));
    }

    #[test]
    fn start_after_shutdown_is_ignored() {
        let network = LoopbackNetwork::new();
        let service = browsers(&network);
        let stream = service.create(
            3,
            PeerIdentity::new("host-dev").unwrap(),
            ServiceDescriptor::new("svc", "host-dev").unwrap(),
        );
        let bundle = service.registry().lookup(&3).unwrap();

        stream.cancel();
        bundle.start();
        assert!(!bundle.is_browsing());
        assert!(!service.contains(&3));
    }

    #[test]
    fn start_is_idempotent() {
        let network = LoopbackNetwork::new();
        let service = browsers(&network);
        let _stream = service.create(
            7,
            PeerIdentity::new("host-dev").unwrap(),
            ServiceDescriptor::new("svc", "host-dev").unwrap(),
        );

        service.start_browsing(&7);
        service.start_browsing(&7);
        assert!(service.is_browsing(&7));
        service.stop_browsing(&7);
        assert!(!service.is_browsing(&7));
    }
}
