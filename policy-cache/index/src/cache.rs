use crate::{
    entry::{CachedSelectorPolicy, Lifecycle, SelectorPolicy},
    metrics::{CacheMetrics, UpdateResult},
    Error, Result,
};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use policy_cache_core::{
    AuthTypes, Identity, IdentityManager, IdentityObserver, NumericIdentity, Repository,
    ResolvedPolicy, SelectorVersion,
};
use std::{fmt, sync::Arc};

type Entry<R> = Arc<CachedSelectorPolicy<<R as Repository>::Policy>>;

/// A cache of resolved policies, by identity.
pub struct PolicyCache<R: Repository> {
    /// A shared handle to the repository. The repository and the cache live for
    /// the lifetime of the process.
    repo: Arc<R>,

    policies: Mutex<HashMap<NumericIdentity, Entry<R>>>,

    metrics: CacheMetrics,
}

// === impl PolicyCache ===

impl<R: Repository> PolicyCache<R> {
    pub fn new(repo: Arc<R>, metrics: CacheMetrics) -> Self {
        Self {
            repo,
            policies: Mutex::new(HashMap::default()),
            metrics,
        }
    }

    /// Creates a shared cache, subscribing it to the identity manager's
    /// lifecycle events so that entries are deleted as identities are removed.
    pub fn shared(
        repo: Arc<R>,
        idmgr: Option<&dyn IdentityManager>,
        metrics: CacheMetrics,
    ) -> Arc<Self> {
        let cache = Arc::new(Self::new(repo, metrics));
        if let Some(idmgr) = idmgr {
            idmgr.subscribe(cache.clone());
        }
        cache
    }

    /// Returns the entry for `identity`, creating an empty one if it does not
    /// exist.
    pub fn lookup_or_create(&self, identity: &Identity) -> Entry<R> {
        self.policies
            .lock()
            .entry(identity.id)
            .or_insert_with(|| Arc::new(CachedSelectorPolicy::new(identity.clone())))
            .clone()
    }

    pub fn get(&self, id: NumericIdentity) -> Option<Entry<R>> {
        self.policies.lock().get(&id).cloned()
    }

    /// Forgets the cached policy for `identity`, detaching it.
    ///
    /// Returns true if an entry was removed.
    pub fn delete(&self, identity: &Identity) -> bool {
        let removed = self.policies.lock().remove(&identity.id);
        let Some(cip) = removed else {
            return false;
        };

        // The entry is no longer reachable through the cache. Releasing it waits
        // for an in-flight update, which may have obtained the entry before it
        // was removed.
        if cip.release() {
            self.metrics.detaches.inc();
        }
        self.metrics.deletes.inc();
        tracing::debug!(identity = %identity.id, "Deleted cached policy");
        true
    }

    /// Resolves the policy for `identity` and publishes it, unless a policy was
    /// already resolved at the repository's current (or a later) revision.
    ///
    /// Returns the identity's entry and whether a new policy was published. On
    /// failure, the previously published policy, if any, remains in place.
    ///
    /// The caller must hold the repository in a state that is safe for reading
    /// policy rules.
    pub fn update_selector_policy(&self, identity: &Identity) -> Result<(Entry<R>, bool)> {
        self.update_from(self.lookup_or_create(identity))
    }

    /// Updates `cip`, moving to the identity's current entry whenever the
    /// entry being updated was released by a concurrent delete.
    pub(crate) fn update_from(&self, mut cip: Entry<R>) -> Result<(Entry<R>, bool)> {
        loop {
            if let Some(updated) = self.update_entry(&cip)? {
                return Ok((cip, updated));
            }
            cip = self.lookup_or_create(cip.identity());
        }
    }

    /// Returns `None` if the entry was released before its lock was acquired.
    fn update_entry(&self, cip: &CachedSelectorPolicy<R::Policy>) -> Result<Option<bool>> {
        let id = cip.identity().id;

        // Endpoints that share an identity may regenerate concurrently. Holding
        // the entry's lock across the revision check and the update ensures that
        // only one of them resolves the policy, and that an older resolution
        // never replaces a newer one.
        let lifecycle = cip.lock();
        if *lifecycle == Lifecycle::Released {
            tracing::trace!(identity = %id, "Cached policy was deleted; retrying");
            return Ok(None);
        }

        let revision = self.repo.revision();
        if let Some(policy) = cip.policy() {
            if policy.revision() >= revision {
                tracing::trace!(identity = %id, revision = policy.revision(), "Policy is up to date");
                self.metrics.update(UpdateResult::UpToDate);
                return Ok(Some(false));
            }
        }

        let policy = match self.repo.resolve_policy(cip.identity()) {
            Ok(policy) => policy,
            Err(error) => {
                tracing::warn!(identity = %id, %error, "Failed to resolve policy");
                self.metrics.update(UpdateResult::Failed);
                return Err(Error::Resolve {
                    identity: id,
                    source: error,
                });
            }
        };

        tracing::debug!(identity = %id, revision = policy.revision(), "Publishing resolved policy");
        if cip.set_policy(&lifecycle, Arc::new(policy)) {
            self.metrics.detaches.inc();
        }
        self.metrics.update(UpdateResult::Resolved);
        Ok(Some(true))
    }

    /// Resolves and caches the policy for `identity`, returning a view for
    /// endpoints to consume.
    ///
    /// The caller must hold the repository in a state that is safe for reading
    /// policy rules.
    pub fn update_policy(&self, identity: &Identity) -> Result<SelectorPolicy<R::Policy>> {
        let (cip, _) = self.update_selector_policy(identity)?;
        Ok(SelectorPolicy::new(cip))
    }

    /// Returns the authentication types that the policy of `local` requires for
    /// traffic with `remote`.
    ///
    /// Returns an empty set if no policy is cached for `local`, i.e. when no
    /// local endpoint uses that identity.
    pub fn get_auth_types(&self, local: NumericIdentity, remote: NumericIdentity) -> AuthTypes {
        let mut types = AuthTypes::new();

        let Some(cip) = self.get(local) else {
            return types;
        };

        // Published policies are immutable, so no lock is needed to read them.
        let Some(policy) = cip.policy() else {
            return types;
        };

        for (cs, required) in policy.auth_map().iter() {
            // Only check whether `cs` selects `remote` if it could add a type
            // that is still missing from the result.
            if required.is_subset(&types) {
                continue;
            }
            if cs.selects(SelectorVersion::Latest, remote) {
                types.extend(required.iter().copied());
            }
        }
        types
    }

    pub fn len(&self) -> usize {
        self.policies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.lock().is_empty()
    }

    /// Returns the number of entries and the number of those with a published
    /// policy.
    pub(crate) fn sizes(&self) -> (usize, usize) {
        let policies = self.policies.lock();
        let resolved = policies.values().filter(|cip| cip.has_policy()).count();
        (policies.len(), resolved)
    }
}

impl<R: Repository> IdentityObserver for PolicyCache<R> {
    /// Entries are created when endpoints update their policy, so additions are
    /// ignored.
    fn local_identity_added(&self, _: &Identity) {}

    fn local_identity_removed(&self, identity: &Identity) {
        self.delete(identity);
    }
}

impl<R: Repository> fmt::Debug for PolicyCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyCache")
            .field("policies", &self.len())
            .finish_non_exhaustive()
    }
}
