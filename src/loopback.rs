//! In-process platform.
//!
//! Advertisers, browsers and sessions created from clones of one
//! [`LoopbackNetwork`] see each other as if they shared a local network:
//! browsers find advertisers of the same service type, invitations reach the
//! advertiser's delegate, and accepted sessions are linked pairwise for data,
//! streams and resources. Callbacks run on whichever thread triggers them;
//! invitation timeouts and resource transfers need a tokio runtime.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::PlatformError;
use crate::identity::{DiscoveryInfo, PeerIdentity, PeerToken, ServiceDescriptor};
use crate::native::{
    AdvertiserDelegate, BrowserDelegate, InvitationHandler, NativeAdvertiser, NativeBrowser,
    NativeSession, OutgoingStream, PeerState, Platform, SendMode, SessionDelegate,
    TransferProgress,
};
use crate::session::Session;

/// Error domain of loopback failures.
pub const DOMAIN: &str = "loopback";

/// The service type was denied with [`LoopbackNetwork::deny`].
pub const CODE_DENIED: i64 = 1;
/// The network was made unavailable with [`LoopbackNetwork::set_unavailable`].
pub const CODE_UNAVAILABLE: i64 = 2;
/// The addressed peer is not connected to the session.
pub const CODE_NOT_CONNECTED: i64 = 3;
/// A send named no peers.
pub const CODE_NO_PEERS: i64 = 4;
/// Reading or writing a resource failed.
pub const CODE_IO: i64 = 5;
/// A resource transfer was cancelled.
pub const CODE_CANCELLED: i64 = 6;

const STREAM_BUFFER: usize = 64 * 1024;

/// Shared in-process "local network".
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    advertisers: Vec<Weak<LoopbackAdvertiser>>,
    browsers: Vec<Weak<LoopbackBrowser>>,
    denied: HashSet<String>,
    unavailable: bool,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to start advertisers and browsers of `service_type`.
    pub fn deny(&self, service_type: impl Into<String>) {
        self.state.lock().denied.insert(service_type.into());
    }

    /// Lift a previous [`deny`](Self::deny).
    pub fn allow(&self, service_type: &str) {
        self.state.lock().denied.remove(service_type);
    }

    /// Make construction of native services fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Number of advertisers currently advertising.
    pub fn advertising_count(&self) -> usize {
        let mut state = self.state.lock();
        state.advertisers.retain(|a| a.strong_count() > 0);
        state
            .advertisers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|a| a.advertising.load(Ordering::Acquire))
            .count()
    }

    fn check_available(&self) -> Result<(), PlatformError> {
        if self.state.lock().unavailable {
            return Err(PlatformError::new(DOMAIN, CODE_UNAVAILABLE, "network unavailable"));
        }
        Ok(())
    }

    fn check_allowed(&self, service_type: &str) -> Result<(), PlatformError> {
        if self.state.lock().denied.contains(service_type) {
            return Err(PlatformError::new(
                DOMAIN,
                CODE_DENIED,
                format!("service type {service_type} denied"),
            ));
        }
        Ok(())
    }

    fn advertising(&self, service_type: &str, except: PeerToken) -> Vec<Arc<LoopbackAdvertiser>> {
        let mut state = self.state.lock();
        state.advertisers.retain(|a| a.strong_count() > 0);
        state
            .advertisers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|a| {
                a.service_type == service_type
                    && a.local.token() != except
                    && a.advertising.load(Ordering::Acquire)
            })
            .collect()
    }

    fn browsing(&self, service_type: &str, except: PeerToken) -> Vec<Arc<LoopbackBrowser>> {
        let mut state = self.state.lock();
        state.browsers.retain(|b| b.strong_count() > 0);
        state
            .browsers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|b| {
                b.service_type == service_type
                    && b.local.token() != except
                    && b.browsing.load(Ordering::Acquire)
            })
            .collect()
    }
}

impl Platform for LoopbackNetwork {
    fn advertiser(
        &self,
        local: &PeerIdentity,
        descriptor: &ServiceDescriptor,
        info: Option<DiscoveryInfo>,
    ) -> Result<Arc<dyn NativeAdvertiser>, PlatformError> {
        self.check_available()?;
        let advertiser = Arc::new(LoopbackAdvertiser {
            network: self.clone(),
            local: local.clone(),
            service_type: descriptor.service_type().to_string(),
            info,
            delegate: Mutex::new(None),
            advertising: AtomicBool::new(false),
        });
        self.state.lock().advertisers.push(Arc::downgrade(&advertiser));
        Ok(advertiser)
    }

    fn browser(
        &self,
        local: &PeerIdentity,
        descriptor: &ServiceDescriptor,
    ) -> Result<Arc<dyn NativeBrowser>, PlatformError> {
        self.check_available()?;
        let browser = Arc::new(LoopbackBrowser {
            network: self.clone(),
            local: local.clone(),
            service_type: descriptor.service_type().to_string(),
            delegate: Mutex::new(None),
            browsing: AtomicBool::new(false),
        });
        self.state.lock().browsers.push(Arc::downgrade(&browser));
        Ok(browser)
    }

    fn session(&self, local: &PeerIdentity) -> Result<Arc<dyn NativeSession>, PlatformError> {
        self.check_available()?;
        Ok(Arc::new_cyclic(|this| LoopbackSession {
            local: local.clone(),
            this: this.clone(),
            delegate: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
        }))
    }
}

struct LoopbackAdvertiser {
    network: LoopbackNetwork,
    local: PeerIdentity,
    service_type: String,
    info: Option<DiscoveryInfo>,
    delegate: Mutex<Option<Weak<dyn AdvertiserDelegate>>>,
    advertising: AtomicBool,
}

impl LoopbackAdvertiser {
    fn delegate(&self) -> Option<Arc<dyn AdvertiserDelegate>> {
        self.delegate.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl NativeAdvertiser for LoopbackAdvertiser {
    fn set_delegate(&self, delegate: Weak<dyn AdvertiserDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    fn start(&self) {
        if let Err(error) = self.network.check_allowed(&self.service_type) {
            if let Some(delegate) = self.delegate() {
                delegate.did_not_start_advertising(error);
            }
            return;
        }
        if self.advertising.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(peer = %self.local, service_type = %self.service_type, "loopback advertising");
        for browser in self.network.browsing(&self.service_type, self.local.token()) {
            if let Some(delegate) = browser.delegate() {
                delegate.found_peer(self.local.clone(), self.info.clone());
            }
        }
    }

    fn stop(&self) {
        if !self.advertising.swap(false, Ordering::AcqRel) {
            return;
        }
        for browser in self.network.browsing(&self.service_type, self.local.token()) {
            if let Some(delegate) = browser.delegate() {
                delegate.lost_peer(self.local.clone());
            }
        }
    }
}

struct LoopbackBrowser {
    network: LoopbackNetwork,
    local: PeerIdentity,
    service_type: String,
    delegate: Mutex<Option<Weak<dyn BrowserDelegate>>>,
    browsing: AtomicBool,
}

impl LoopbackBrowser {
    fn delegate(&self) -> Option<Arc<dyn BrowserDelegate>> {
        self.delegate.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl NativeBrowser for LoopbackBrowser {
    fn set_delegate(&self, delegate: Weak<dyn BrowserDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    fn start(&self) {
        if let Err(error) = self.network.check_allowed(&self.service_type) {
            if let Some(delegate) = self.delegate() {
                delegate.did_not_start_browsing(error);
            }
            return;
        }
        if self.browsing.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(delegate) = self.delegate() else {
            return;
        };
        for advertiser in self.network.advertising(&self.service_type, self.local.token()) {
            delegate.found_peer(advertiser.local.clone(), advertiser.info.clone());
        }
    }

    fn stop(&self) {
        self.browsing.store(false, Ordering::Release);
    }

    fn invite(
        &self,
        peer: &PeerIdentity,
        session: &Session,
        context: Option<Bytes>,
        timeout: Duration,
    ) {
        let Some(inviter) = LoopbackSession::resolve(session) else {
            warn!(session = session.id(), "session is not a loopback session");
            return;
        };
        inviter.notify(peer.clone(), PeerState::Connecting);

        let target = self
            .network
            .advertising(&self.service_type, self.local.token())
            .into_iter()
            .find(|a| &a.local == peer)
            .and_then(|a| a.delegate());
        let Some(target) = target else {
            debug!(%peer, "invited peer is not advertising");
            inviter.notify(peer.clone(), PeerState::NotConnected);
            return;
        };

        let settled = Arc::new(AtomicBool::new(false));
        let handler: InvitationHandler = {
            let settled = Arc::clone(&settled);
            let inviter = Arc::clone(&inviter);
            let peer = peer.clone();
            Box::new(move |accept, session| {
                if settled.swap(true, Ordering::AcqRel) {
                    debug!(%peer, "answer arrived after invitation settled");
                    return;
                }
                match (accept, session.as_ref().and_then(LoopbackSession::resolve)) {
                    (true, Some(joined)) => LoopbackSession::link(&inviter, &joined),
                    _ => inviter.notify(peer, PeerState::NotConnected),
                }
            })
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inviter = Arc::clone(&inviter);
                let peer = peer.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if !settled.swap(true, Ordering::AcqRel) {
                        debug!(%peer, "invitation timed out");
                        inviter.notify(peer, PeerState::NotConnected);
                    }
                });
            }
            Err(_) => trace!("no runtime, invitation timeout not enforced"),
        }

        target.did_receive_invitation(inviter.local.clone(), context, handler);
    }
}

/// Loopback implementation of a native session.
pub struct LoopbackSession {
    local: PeerIdentity,
    this: Weak<LoopbackSession>,
    delegate: Mutex<Option<Weak<dyn SessionDelegate>>>,
    links: Mutex<HashMap<PeerToken, Weak<LoopbackSession>>>,
}

impl LoopbackSession {
    fn resolve(session: &Session) -> Option<Arc<LoopbackSession>> {
        session
            .native()
            .as_any()
            .downcast_ref::<LoopbackSession>()
            .and_then(|s| s.this.upgrade())
    }

    fn link(a: &Arc<LoopbackSession>, b: &Arc<LoopbackSession>) {
        if a.local == b.local {
            warn!(peer = %a.local, "refusing to link a session to itself");
            return;
        }
        a.links.lock().insert(b.local.token(), Arc::downgrade(b));
        b.links.lock().insert(a.local.token(), Arc::downgrade(a));
        a.notify(b.local.clone(), PeerState::Connected);
        b.notify(a.local.clone(), PeerState::Connected);
    }

    fn delegate(&self) -> Option<Arc<dyn SessionDelegate>> {
        self.delegate.lock().as_ref().and_then(Weak::upgrade)
    }

    fn notify(&self, peer: PeerIdentity, state: PeerState) {
        if let Some(delegate) = self.delegate() {
            delegate.peer_did_change_state(peer, state);
        }
    }

    fn linked(&self, peer: &PeerIdentity) -> Result<Arc<LoopbackSession>, PlatformError> {
        self.links
            .lock()
            .get(&peer.token())
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                PlatformError::new(DOMAIN, CODE_NOT_CONNECTED, format!("{peer} is not connected"))
            })
    }
}

impl NativeSession for LoopbackSession {
    fn set_delegate(&self, delegate: Weak<dyn SessionDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    fn send(
        &self,
        data: Bytes,
        peers: &[PeerIdentity],
        _mode: SendMode,
    ) -> Result<(), PlatformError> {
        if peers.is_empty() {
            return Err(PlatformError::new(DOMAIN, CODE_NO_PEERS, "no peers to send to"));
        }
        let targets = peers
            .iter()
            .map(|peer| self.linked(peer))
            .collect::<Result<Vec<_>, _>>()?;
        for target in targets {
            if let Some(delegate) = target.delegate() {
                delegate.did_receive_data(data.clone(), self.local.clone());
            }
        }
        Ok(())
    }

    fn start_stream(
        &self,
        name: &str,
        peer: &PeerIdentity,
    ) -> Result<OutgoingStream, PlatformError> {
        let target = self.linked(peer)?;
        let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);
        if let Some(delegate) = target.delegate() {
            delegate.did_receive_stream(Box::pin(theirs), name.to_string(), self.local.clone());
        }
        Ok(Box::pin(ours))
    }

    fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerIdentity,
    ) -> Result<TransferProgress, PlatformError> {
        let target = self.linked(peer)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PlatformError::new(DOMAIN, CODE_UNAVAILABLE, "resource transfer needs a tokio runtime")
        })?;

        let progress = TransferProgress::new(0);
        let Some(delegate) = target.delegate() else {
            return Ok(progress);
        };
        delegate.did_start_receiving_resource(
            name.to_string(),
            self.local.clone(),
            progress.clone(),
        );

        let source = path.to_path_buf();
        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        let destination = std::env::temp_dir().join(format!(
            "loopback-{}-{}",
            target.local.token(),
            file_name
        ));
        let from = self.local.clone();
        let name = name.to_string();
        let shared = progress.clone();
        runtime.spawn(async move {
            let result = copy_resource(&source, &destination, &shared).await;
            delegate.did_finish_receiving_resource(name, from, result);
        });
        Ok(progress)
    }

    fn connected_peers(&self) -> Vec<PeerIdentity> {
        let mut links = self.links.lock();
        links.retain(|_, peer| peer.strong_count() > 0);
        links
            .values()
            .filter_map(Weak::upgrade)
            .map(|peer| peer.local.clone())
            .collect()
    }

    fn disconnect(&self) {
        let peers: Vec<_> = self
            .links
            .lock()
            .drain()
            .filter_map(|(_, peer)| peer.upgrade())
            .collect();
        for peer in peers {
            peer.links.lock().remove(&self.local.token());
            peer.notify(self.local.clone(), PeerState::NotConnected);
            self.notify(peer.local.clone(), PeerState::NotConnected);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

async fn copy_resource(
    source: &Path,
    destination: &Path,
    progress: &TransferProgress,
) -> Result<PathBuf, PlatformError> {
    let io_error = |e: std::io::Error| PlatformError::new(DOMAIN, CODE_IO, e.to_string());
    let contents = tokio::fs::read(source).await.map_err(io_error)?;
    progress.set_total(contents.len() as u64);
    if progress.is_cancelled() {
        return Err(PlatformError::new(DOMAIN, CODE_CANCELLED, "transfer cancelled"));
    }
    tokio::fs::write(destination, &contents)
        .await
        .map_err(io_error)?;
    progress.set_completed(contents.len() as u64);
    Ok(destination.to_path_buf())
}
