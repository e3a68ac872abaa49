//! Cancellable, ordered event streams over callback-driven nearby peer
//! discovery.
//!
//! A [`Platform`] supplies native advertisers, browsers and sessions that
//! report through delegate callbacks on arbitrary threads. The services in
//! this crate own those natives by key, bridge their callbacks into
//! [`EventStream`]s, and tear everything down when a stream is cancelled or
//! dropped. [`Dispatcher`] merges the streams for a single-threaded reducer,
//! and [`LoopbackNetwork`] is an in-process platform for tests and demos.

#![deny(missing_docs)]

pub mod advertiser;
pub mod bridge;
pub mod browser;
pub mod config;
pub mod dispatch;
pub mod environment;
pub mod error;
pub mod identity;
pub mod loopback;
pub mod native;
pub mod registry;
pub mod session;

pub use advertiser::{AdvertiserEvent, AdvertiserService, InvitationResponder};
pub use bridge::{CancelHandle, EventSink, EventStream};
pub use browser::{BrowserEvent, BrowserService};
pub use config::BridgeConfig;
pub use dispatch::{ActionSender, Dispatcher};
pub use environment::Environment;
pub use error::{Error, PlatformError, Result};
pub use identity::{DiscoveryInfo, PeerIdentity, PeerToken, ServiceDescriptor};
pub use loopback::LoopbackNetwork;
pub use native::{PeerState, Platform, SendMode, TransferProgress};
pub use registry::{DuplicatePolicy, RegistryKey, ServiceRegistry};
pub use session::{Session, SessionEvent, SessionService};
