//! Concurrency-safe registry of live service instances.
//!
//! One registry exists per service kind. Each entry owns the resource bundle
//! (native handle plus its delegate) for exactly one caller-chosen key. The
//! registry is the single source of truth for commands addressed by key:
//! a lookup miss means "not created yet" or "already cancelled".

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::{Error, Result};

/// Bound for caller-chosen registry keys.
pub trait RegistryKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> RegistryKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// What to do when registering under a key that already has a live bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Fail with [`Error::AlreadyRegistered`].
    Reject,
    /// Install the new bundle and hand back the previous one for shutdown.
    Replace,
}

/// Identifies one registration, so a stale owner cannot remove its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

/// Outcome of a successful [`ServiceRegistry::register`].
#[derive(Debug)]
pub struct Registration<B> {
    /// The id of the new registration.
    pub instance: InstanceId,
    /// The bundle displaced under [`DuplicatePolicy::Replace`].
    pub replaced: Option<Arc<B>>,
}

struct Slot<B> {
    instance: InstanceId,
    bundle: Arc<B>,
}

/// Mapping from key to the live resource bundle for that key.
pub struct ServiceRegistry<K, B> {
    entries: DashMap<K, Slot<B>>,
    policy: DuplicatePolicy,
    next_instance: AtomicU64,
}

impl<K: RegistryKey, B> ServiceRegistry<K, B> {
    /// Create an empty registry with the given duplicate policy.
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            next_instance: AtomicU64::new(1),
        }
    }

    /// The policy applied on duplicate registration.
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Install a bundle for `key`.
    pub fn register(&self, key: K, bundle: Arc<B>) -> Result<Registration<B>> {
        let instance = InstanceId(self.next_instance.fetch_add(1, Ordering::Relaxed));
        match self.entries.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot { instance, bundle });
                Ok(Registration {
                    instance,
                    replaced: None,
                })
            }
            Entry::Occupied(mut occupied) => match self.policy {
                DuplicatePolicy::Reject => Err(Error::already_registered(occupied.key())),
                DuplicatePolicy::Replace => {
                    debug!(key = ?occupied.key(), "replacing live registry entry");
                    let previous = occupied.insert(Slot { instance, bundle });
                    Ok(Registration {
                        instance,
                        replaced: Some(previous.bundle),
                    })
                }
            },
        }
    }

    /// The live bundle for `key`.
    pub fn lookup(&self, key: &K) -> Result<Arc<B>> {
        self.entries
            .get(key)
            .map(|slot| Arc::clone(&slot.bundle))
            .ok_or_else(|| Error::not_registered(key))
    }

    /// Deregister `key`, returning its bundle so the caller can shut it down.
    pub fn remove(&self, key: &K) -> Result<Arc<B>> {
        self.entries
            .remove(key)
            .map(|(_, slot)| slot.bundle)
            .ok_or_else(|| Error::not_registered(key))
    }

    /// Deregister `key` only if it still holds `instance`.
    pub fn remove_instance(&self, key: &K, instance: InstanceId) -> Option<Arc<B>> {
        self.entries
            .remove_if(key, |_, slot| slot.instance == instance)
            .map(|(_, slot)| slot.bundle)
    }

    /// Whether a live bundle exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of live bundles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: RegistryKey, B> Debug for ServiceRegistry<K, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("policy", &self.policy)
            .field("len", &self.entries.len())
            .finish()
    }
}
