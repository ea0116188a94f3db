use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use policy_cache_core::{Identity, IdentityManager, IdentityObserver, NumericIdentity};
use std::{collections::hash_map::Entry, sync::Arc};

/// Counts the local endpoints using each identity, notifying observers when an
/// identity gains its first endpoint or loses its last one.
///
/// Observers are notified after the manager's lock is released, so they may
/// call back into the manager.
#[derive(Default)]
pub struct LocalIdentities(Mutex<Inner>);

#[derive(Default)]
struct Inner {
    refs: HashMap<NumericIdentity, (Identity, usize)>,
    observers: Vec<Arc<dyn IdentityObserver>>,
}

// === impl LocalIdentities ===

impl LocalIdentities {
    pub fn add(&self, identity: &Identity) {
        let observers = {
            let mut inner = self.0.lock();
            let inner = &mut *inner;
            match inner.refs.entry(identity.id) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().1 += 1;
                    return;
                }
                Entry::Vacant(entry) => {
                    entry.insert((identity.clone(), 1));
                }
            }
            inner.observers.clone()
        };

        tracing::debug!(identity = %identity.id, "Local identity added");
        for observer in &observers {
            observer.local_identity_added(identity);
        }
    }

    /// Drops a reference to `identity`.
    ///
    /// Returns false if the identity was not in use.
    pub fn remove(&self, identity: &Identity) -> bool {
        let (identity, observers) = {
            let mut inner = self.0.lock();
            let inner = &mut *inner;
            let mut entry = match inner.refs.entry(identity.id) {
                Entry::Occupied(entry) => entry,
                Entry::Vacant(_) => return false,
            };
            entry.get_mut().1 -= 1;
            if entry.get().1 > 0 {
                return true;
            }
            let (identity, _) = entry.remove();
            (identity, inner.observers.clone())
        };

        tracing::debug!(identity = %identity.id, "Local identity removed");
        for observer in &observers {
            observer.local_identity_removed(&identity);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.0.lock().refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().refs.is_empty()
    }
}

impl IdentityManager for LocalIdentities {
    fn subscribe(&self, observer: Arc<dyn IdentityObserver>) {
        self.0.lock().observers.push(observer);
    }
}
