//! Bridge configuration.

use std::time::Duration;

use crate::registry::DuplicatePolicy;

/// Default time a remote peer has to answer an invitation.
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Policies and defaults for the three services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Duplicate create under one advertiser key. Default: replace.
    pub advertiser_policy: DuplicatePolicy,
    /// Duplicate create under one browser key. Default: replace.
    pub browser_policy: DuplicatePolicy,
    /// Duplicate create under one session key. Default: reject.
    pub session_policy: DuplicatePolicy,
    /// Timeout used by [`invite_peer_default`](crate::Environment::invite_peer_default).
    pub invite_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            advertiser_policy: DuplicatePolicy::Replace,
            browser_policy: DuplicatePolicy::Replace,
            session_policy: DuplicatePolicy::Reject,
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    /// Set the advertiser duplicate policy.
    pub fn advertiser_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.advertiser_policy = policy;
        self
    }

    /// Set the browser duplicate policy.
    pub fn browser_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.browser_policy = policy;
        self
    }

    /// Set the session duplicate policy.
    pub fn session_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.session_policy = policy;
        self
    }

    /// Set the default invitation timeout.
    pub fn invite_timeout(mut self, timeout: Duration) -> Self {
        self.invite_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let config = BridgeConfig::default();
        assert_eq!(config.advertiser_policy, DuplicatePolicy::Replace);
        assert_eq!(config.session_policy, DuplicatePolicy::Reject);
        assert_eq!(config.invite_timeout, DEFAULT_INVITE_TIMEOUT);

        let config = config
            .session_policy(DuplicatePolicy::Replace)
            .invite_timeout(Duration::from_secs(1));
        assert_eq!(config.session_policy, DuplicatePolicy::Replace);
        assert_eq!(config.invite_timeout, Duration::from_secs(1));
    }
}
