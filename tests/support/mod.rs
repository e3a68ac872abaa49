//! A platform whose natives record commands and expose their delegates, so
//! tests can fire native callbacks by hand.

#![allow(dead_code)]

use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use nearby_bridge::native::{
    AdvertiserDelegate, BrowserDelegate, NativeAdvertiser, NativeBrowser, NativeSession,
    OutgoingStream, SessionDelegate,
};
use nearby_bridge::{
    DiscoveryInfo, PeerIdentity, PlatformError, Platform, SendMode, ServiceDescriptor, Session,
    TransferProgress,
};

/// Records every native it constructs.
#[derive(Clone, Default)]
pub struct RecordingPlatform {
    pub advertisers: Arc<Mutex<Vec<Arc<RecordingAdvertiser>>>>,
    pub browsers: Arc<Mutex<Vec<Arc<RecordingBrowser>>>>,
    pub sessions: Arc<Mutex<Vec<Arc<RecordingSession>>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later construction fail.
    pub fn fail_construction(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn advertiser(&self, index: usize) -> Arc<RecordingAdvertiser> {
        Arc::clone(&self.advertisers.lock()[index])
    }

    pub fn browser(&self, index: usize) -> Arc<RecordingBrowser> {
        Arc::clone(&self.browsers.lock()[index])
    }

    pub fn session(&self, index: usize) -> Arc<RecordingSession> {
        Arc::clone(&self.sessions.lock()[index])
    }

    fn check(&self) -> Result<(), PlatformError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PlatformError::new("recording", -1, "construction refused"));
        }
        Ok(())
    }
}

impl Platform for RecordingPlatform {
    fn advertiser(
        &self,
        _local: &PeerIdentity,
        _descriptor: &ServiceDescriptor,
        _info: Option<DiscoveryInfo>,
    ) -> Result<Arc<dyn NativeAdvertiser>, PlatformError> {
        self.check()?;
        let native = Arc::new(RecordingAdvertiser::default());
        self.advertisers.lock().push(Arc::clone(&native));
        Ok(native)
    }

    fn browser(
        &self,
        _local: &PeerIdentity,
        _descriptor: &ServiceDescriptor,
    ) -> Result<Arc<dyn NativeBrowser>, PlatformError> {
        self.check()?;
        let native = Arc::new(RecordingBrowser::default());
        self.browsers.lock().push(Arc::clone(&native));
        Ok(native)
    }

    fn session(&self, _local: &PeerIdentity) -> Result<Arc<dyn NativeSession>, PlatformError> {
        self.check()?;
        let native = Arc::new(RecordingSession::default());
        self.sessions.lock().push(Arc::clone(&native));
        Ok(native)
    }
}

#[derive(Default)]
pub struct RecordingAdvertiser {
    delegate: Mutex<Option<Weak<dyn AdvertiserDelegate>>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl RecordingAdvertiser {
    /// The attached delegate, if it is still alive.
    pub fn delegate(&self) -> Option<Arc<dyn AdvertiserDelegate>> {
        self.delegate.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl NativeAdvertiser for RecordingAdvertiser {
    fn set_delegate(&self, delegate: Weak<dyn AdvertiserDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// One recorded `invite` call.
#[derive(Debug, Clone)]
pub struct Invite {
    pub peer: PeerIdentity,
    pub session: Session,
    pub context: Option<Bytes>,
    pub timeout: Duration,
}

#[derive(Default)]
pub struct RecordingBrowser {
    delegate: Mutex<Option<Weak<dyn BrowserDelegate>>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub invites: Mutex<Vec<Invite>>,
}

impl RecordingBrowser {
    pub fn delegate(&self) -> Option<Arc<dyn BrowserDelegate>> {
        self.delegate.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl NativeBrowser for RecordingBrowser {
    fn set_delegate(&self, delegate: Weak<dyn BrowserDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn invite(
        &self,
        peer: &PeerIdentity,
        session: &Session,
        context: Option<Bytes>,
        timeout: Duration,
    ) {
        self.invites.lock().push(Invite {
            peer: peer.clone(),
            session: session.clone(),
            context,
            timeout,
        });
    }
}

#[derive(Default)]
pub struct RecordingSession {
    delegate: Mutex<Option<Weak<dyn SessionDelegate>>>,
    pub sent: Mutex<Vec<(Bytes, Vec<PeerIdentity>)>>,
    pub disconnects: AtomicUsize,
    pub refuse_sends: AtomicBool,
}

impl RecordingSession {
    pub fn delegate(&self) -> Option<Arc<dyn SessionDelegate>> {
        self.delegate.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl NativeSession for RecordingSession {
    fn set_delegate(&self, delegate: Weak<dyn SessionDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    fn send(
        &self,
        data: Bytes,
        peers: &[PeerIdentity],
        _mode: SendMode,
    ) -> Result<(), PlatformError> {
        if self.refuse_sends.load(Ordering::SeqCst) {
            return Err(PlatformError::new("recording", 7, "send refused"));
        }
        self.sent.lock().push((data, peers.to_vec()));
        Ok(())
    }

    fn start_stream(
        &self,
        _name: &str,
        _peer: &PeerIdentity,
    ) -> Result<OutgoingStream, PlatformError> {
        Err(PlatformError::new("recording", 8, "streams unsupported"))
    }

    fn send_resource(
        &self,
        _path: &Path,
        _name: &str,
        _peer: &PeerIdentity,
    ) -> Result<TransferProgress, PlatformError> {
        Err(PlatformError::new("recording", 9, "resources unsupported"))
    }

    fn connected_peers(&self) -> Vec<PeerIdentity> {
        Vec::new()
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
