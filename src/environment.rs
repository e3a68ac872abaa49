//! The three services wired to one platform.

use std::sync::Arc;

use bytes::Bytes;

use crate::advertiser::AdvertiserService;
use crate::browser::BrowserService;
use crate::config::BridgeConfig;
use crate::identity::PeerIdentity;
use crate::native::Platform;
use crate::registry::{RegistryKey, ServiceRegistry};
use crate::session::SessionService;

/// Advertiser, browser and session services sharing one platform.
///
/// The browser service sees the session service's registry, so invitations
/// can only offer sessions that are live.
#[derive(Clone, Debug)]
pub struct Environment<K: RegistryKey> {
    /// Announce presence, receive invitations.
    pub advertiser: AdvertiserService<K>,
    /// Discover peers, send invitations.
    pub browser: BrowserService<K>,
    /// Accepted connections and data exchange.
    pub session: SessionService<K>,
    config: BridgeConfig,
}

impl<K: RegistryKey> Environment<K> {
    /// Build the services with registries following `config`.
    pub fn new(platform: Arc<dyn Platform>, config: BridgeConfig) -> Self {
        let sessions = Arc::new(ServiceRegistry::new(config.session_policy));
        Self {
            advertiser: AdvertiserService::with_policy(
                Arc::clone(&platform),
                config.advertiser_policy,
            ),
            browser: BrowserService::with_policy(
                Arc::clone(&platform),
                config.browser_policy,
                Arc::clone(&sessions),
            ),
            session: SessionService::new(platform, sessions),
            config,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Invite `peer` with the configured default timeout.
    pub fn invite_peer_default(
        &self,
        browser_key: &K,
        peer: &PeerIdentity,
        session_key: &K,
        context: Option<Bytes>,
    ) {
        self.browser.invite_peer(
            browser_key,
            peer,
            session_key,
            context,
            self.config.invite_timeout,
        );
    }
}
