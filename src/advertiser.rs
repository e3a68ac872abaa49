//! Advertiser service: announce presence, receive invitations.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{self, EventSink, EventStream};
use crate::error::PlatformError;
use crate::identity::{DiscoveryInfo, PeerIdentity, ServiceDescriptor};
use crate::native::{AdvertiserDelegate, InvitationHandler, NativeAdvertiser, Platform};
use crate::registry::{DuplicatePolicy, RegistryKey, ServiceRegistry};
use crate::session::Session;
use crate::{Error, Result};

/// Registry type for advertiser instances.
pub type AdvertiserRegistry<K> = ServiceRegistry<K, AdvertiserBundle>;

/// Events emitted by an advertiser instance.
#[derive(Debug, Clone)]
pub enum AdvertiserEvent {
    /// The advertiser could not be created; the stream ends after this.
    CreationFailed(Error),
    /// The platform refused to start advertising. The advertiser stays idle.
    FailedToStart(Error),
    /// A remote peer invited us. Answer through the responder exactly once.
    InvitationReceived(PeerIdentity, Option<Bytes>, InvitationResponder),
}

impl PartialEq for AdvertiserEvent {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::CreationFailed(l), Self::CreationFailed(r)) => l == r,
            (Self::FailedToStart(l), Self::FailedToStart(r)) => l == r,
            (Self::InvitationReceived(lp, lc, _), Self::InvitationReceived(rp, rc, _)) => {
                lp == rp && lc == rc
            }
            _ => false,
        }
    }
}

/// Single-use answer to one inbound invitation.
///
/// Clones share the same answer: whichever responds first wins, later
/// attempts fail with [`Error::InvitationAlreadyAnswered`] and have no effect.
/// If every clone is dropped unanswered, the invitation is declined.
/// The responder does not depend on the advertiser's stream, so it can still
/// be answered after that stream is cancelled.
#[derive(Clone)]
pub struct InvitationResponder {
    inner: Arc<ResponderInner>,
}

struct ResponderInner {
    from: PeerIdentity,
    answered: AtomicBool,
    handler: Mutex<Option<InvitationHandler>>,
}

impl InvitationResponder {
    /// Wrap the platform's continuation for an invitation from `from`.
    pub fn new(from: PeerIdentity, handler: InvitationHandler) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                from,
                answered: AtomicBool::new(false),
                handler: Mutex::new(Some(handler)),
            }),
        }
    }

    /// The inviting peer.
    pub fn from_peer(&self) -> &PeerIdentity {
        &self.inner.from
    }

    /// Whether an answer has been given.
    pub fn is_answered(&self) -> bool {
        self.inner.answered.load(Ordering::Acquire)
    }

    /// Accept, binding the connection to `session`.
    pub fn accept(&self, session: &Session) -> Result<()> {
        self.respond(true, Some(session.clone()))
    }

    /// Decline.
    pub fn decline(&self) -> Result<()> {
        self.respond(false, None)
    }

    /// Answer the invitation.
    ///
    /// Accepting without a live session is refused before the answer is
    /// consumed, so the invitation can still be answered.
    pub fn respond(&self, accept: bool, session: Option<Session>) -> Result<()> {
        if accept {
            match &session {
                None => return Err(Error::SessionRequired),
                Some(session) if !session.is_live() => {
                    return Err(Error::SessionClosed(session.id()));
                }
                Some(_) => {}
            }
        }
        if self.inner.answered.swap(true, Ordering::AcqRel) {
            warn!(peer = %self.inner.from, "invitation already answered, ignoring");
            return Err(Error::InvitationAlreadyAnswered(self.inner.from.to_string()));
        }
        debug!(peer = %self.inner.from, accept, "answering invitation");
        let handler = self.inner.handler.lock().take();
        if let Some(handler) = handler {
            handler(accept, session);
        }
        Ok(())
    }
}

impl Drop for ResponderInner {
    fn drop(&mut self) {
        if self.answered.load(Ordering::Acquire) {
            return;
        }
        if let Some(handler) = self.handler.get_mut().take() {
            warn!(peer = %self.from, "invitation dropped unanswered, declining");
            handler(false, None);
        }
    }
}

impl fmt::Debug for InvitationResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvitationResponder")
            .field("from", &self.inner.from)
            .field("answered", &self.is_answered())
            .finish()
    }
}

struct AdvertiserAdapter {
    sink: EventSink<AdvertiserEvent>,
    advertising: Arc<AtomicBool>,
}

impl AdvertiserDelegate for AdvertiserAdapter {
    fn did_not_start_advertising(&self, error: PlatformError) {
        self.advertising.store(false, Ordering::Release);
        let error = Error::StartFailed(error);
        self.sink.send(AdvertiserEvent::FailedToStart(error));
    }

    fn did_receive_invitation(
        &self,
        from: PeerIdentity,
        context: Option<Bytes>,
        handler: InvitationHandler,
    ) {
        let responder = InvitationResponder::new(from.clone(), handler);
        let event = AdvertiserEvent::InvitationReceived(from, context, responder);
        self.sink.send(event);
    }
}

/// Resources owned by one live advertiser entry.
pub struct AdvertiserBundle {
    native: Arc<dyn NativeAdvertiser>,
    delegate: Arc<AdvertiserAdapter>,
    advertising: Arc<AtomicBool>,
    token: CancellationToken,
}

impl AdvertiserBundle {
    /// Whether the platform is (believed to be) advertising.
    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::Acquire)
    }

    fn start(&self) {
        if self.token.is_cancelled() {
            return;
        }
        if !self.advertising.swap(true, Ordering::AcqRel) {
            self.native.start();
            // A shutdown racing the start above may have missed it.
            if self.token.is_cancelled() {
                self.stop();
            }
        }
    }

    fn stop(&self) {
        if self.advertising.swap(false, Ordering::AcqRel) {
            self.native.stop();
        }
    }

    fn shutdown(&self) {
        self.token.cancel();
        self.stop();
    }
}

/// Owns advertiser instances by key.
#[derive(Clone)]
pub struct AdvertiserService<K: RegistryKey> {
    platform: Arc<dyn Platform>,
    registry: Arc<AdvertiserRegistry<K>>,
}

impl<K: RegistryKey> AdvertiserService<K> {
    /// Create a service over an injected registry.
    pub fn new(platform: Arc<dyn Platform>, registry: Arc<AdvertiserRegistry<K>>) -> Self {
        Self { platform, registry }
    }

    /// Create a service with its own registry.
    pub fn with_policy(platform: Arc<dyn Platform>, policy: DuplicatePolicy) -> Self {
        Self::new(platform, Arc::new(ServiceRegistry::new(policy)))
    }

    /// The registry backing this service.
    pub fn registry(&self) -> &Arc<AdvertiserRegistry<K>> {
        &self.registry
    }

    /// Create an idle advertiser for `local` under `key`.
    pub fn create(
        &self,
        key: K,
        local: PeerIdentity,
        descriptor: ServiceDescriptor,
    ) -> EventStream<AdvertiserEvent> {
        self.create_with_info(key, local, descriptor, None)
    }

    /// Create an idle advertiser that publishes `info` to browsers.
    pub fn create_with_info(
        &self,
        key: K,
        local: PeerIdentity,
        descriptor: ServiceDescriptor,
        info: Option<DiscoveryInfo>,
    ) -> EventStream<AdvertiserEvent> {
        debug!(
            key = ?key,
            peer = %local,
            service_type = descriptor.service_type(),
            "creating advertiser"
        );
        let (sink, stream) = bridge::channel();

        let native = match self.platform.advertiser(&local, &descriptor, info) {
            Ok(native) => native,
            Err(error) => {
                warn!(key = ?key, %error, "platform failed to create advertiser");
                sink.send(AdvertiserEvent::CreationFailed(Error::CreationFailed(error)));
                return stream;
            }
        };

        let advertising = Arc::new(AtomicBool::new(false));
        let bundle = Arc::new(AdvertiserBundle {
            native: Arc::clone(&native),
            delegate: Arc::new(AdvertiserAdapter {
                sink: sink.clone(),
                advertising: Arc::clone(&advertising),
            }),
            advertising,
            token: sink.cancellation_token(),
        });

        let registration = match self.registry.register(key.clone(), Arc::clone(&bundle)) {
            Ok(registration) => registration,
            Err(error) => {
                warn!(key = ?key, %error, "advertiser not registered");
                sink.send(AdvertiserEvent::CreationFailed(error));
                return stream;
            }
        };
        if let Some(previous) = registration.replaced {
            previous.shutdown();
        }

        let delegate: Arc<dyn AdvertiserDelegate> = bundle.delegate.clone();
        native.set_delegate(Arc::downgrade(&delegate));

        let registry = Arc::clone(&self.registry);
        let instance = registration.instance;
        stream.cancel_handle().on_cancel(move || {
            debug!(key = ?key, "deleting advertiser dependencies");
            if let Some(bundle) = registry.remove_instance(&key, instance) {
                bundle.shutdown();
            }
        });
        stream
    }

    /// Start advertising. No-op if nothing is registered under `key` or it is
    /// already advertising.
    pub fn start_advertising(&self, key: &K) {
        match self.registry.lookup(key) {
            Ok(bundle) => {
                debug!(key = ?key, "start advertising");
                bundle.start();
            }
            Err(_) => debug!(key = ?key, "start advertising on unregistered key ignored"),
        }
    }

    /// Stop advertising. No-op if nothing is registered under `key`.
    pub fn stop_advertising(&self, key: &K) {
        match self.registry.lookup(key) {
            Ok(bundle) => {
                debug!(key = ?key, "stop advertising");
                bundle.stop();
            }
            Err(_) => debug!(key = ?key, "stop advertising on unregistered key ignored"),
        }
    }

    /// Whether the advertiser under `key` is advertising.
    pub fn is_advertising(&self, key: &K) -> bool {
        self.registry
            .lookup(key)
            .map(|bundle| bundle.is_advertising())
            .unwrap_or(false)
    }

    /// Whether an advertiser is registered under `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.registry.contains(key)
    }
}

impl<K: RegistryKey> fmt::Debug for AdvertiserService<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvertiserService")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures_util::StreamExt;

    use super::*;
    use crate::loopback::LoopbackNetwork;
    use crate::session::{SessionEvent, SessionService};

    fn counting_responder() -> (InvitationResponder, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let accepted = Arc::new(AtomicUsize::new(0));
        let declined = Arc::new(AtomicUsize::new(0));
        let (a, d) = (Arc::clone(&accepted), Arc::clone(&declined));
        let responder = InvitationResponder::new(
            PeerIdentity::new("remote").unwrap(),
            Box::new(move |accept, _| {
                if accept {
                    a.fetch_add(1, Ordering::SeqCst);
                } else {
                    d.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        (responder, accepted, declined)
    }

    #[test]
    fn second_answer_is_ignored() {
        let (responder, accepted, declined) = counting_responder();
        let copy = responder.clone();

        responder.decline().unwrap();
        assert!(matches!(
            copy.decline(),
            Err(Error::InvitationAlreadyAnswered(_))
        ));
        assert!(copy.is_answered());

        drop(responder);
        drop(copy);
        assert_eq!(declined.load(Ordering::SeqCst), 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn accept_requires_session() {
        let (responder, accepted, _) = counting_responder();
        assert_eq!(responder.respond(true, None), Err(Error::SessionRequired));
        assert!(!responder.is_answered());
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn accept_requires_live_session() {
        let sessions: SessionService<u8> =
            SessionService::with_policy(Arc::new(LoopbackNetwork::new()), DuplicatePolicy::Reject);
        let mut stream = sessions.create(1, PeerIdentity::new("host-dev").unwrap());
        let Some(SessionEvent::Created(session)) = stream.next().await else {
            panic!("expected Created");
        };
        stream.cancel();

        let (responder, accepted, declined) = counting_responder();
        assert_eq!(
            responder.accept(&session),
            Err(Error::SessionClosed(session.id()))
        );
        assert!(!responder.is_answered());
        assert_eq!(accepted.load(Ordering::SeqCst), 0);

        responder.decline().unwrap();
        assert_eq!(declined.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_after_shutdown_is_ignored() {
        let network = LoopbackNetwork::new();
        let service: AdvertiserService<u8> =
            AdvertiserService::with_policy(Arc::new(network.clone()), DuplicatePolicy::Replace);
        let stream = service.create(
            1,
            PeerIdentity::new("host-dev").unwrap(),
            ServiceDescriptor::new("svc", "host-dev").unwrap(),
        );
        let bundle = service.registry().lookup(&1).unwrap();

        stream.cancel();
        bundle.start();
        assert!(!bundle.is_advertising());
        assert_eq!(network.advertising_count(), 0);
    }

    #[test]
    fn dropping_unanswered_declines() {
        let (responder, accepted, declined) = counting_responder();
        let copy = responder.clone();
        drop(responder);
        assert_eq!(declined.load(Ordering::SeqCst), 0);
        drop(copy);
        assert_eq!(declined.load(Ordering::SeqCst), 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invitation_events_compare_without_responder() {
        let peer = PeerIdentity::new("remote").unwrap();
        let (first, _, _) = counting_responder();
        let (second, _, _) = counting_responder();
        assert_eq!(
            AdvertiserEvent::InvitationReceived(peer.clone(), None, first),
            AdvertiserEvent::InvitationReceived(peer, None, second)
        );
    }
}
