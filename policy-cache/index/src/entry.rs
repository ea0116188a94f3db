use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use policy_cache_core::{
    Identity, L4Filter, PerSelectorPolicy, PolicyOwner, RedirectPorts, ResolvedPolicy, Revision,
};
use std::sync::Arc;

/// Holds the resolved policy for a single identity.
///
/// The published policy is replaced wholesale and never mutated, so readers
/// only hold the slot lock long enough to clone the `Arc`.
#[derive(Debug)]
pub struct CachedSelectorPolicy<P> {
    identity: Identity,

    /// Serializes revision checks, resolution, and release.
    lifecycle: Mutex<Lifecycle>,

    policy: RwLock<Option<Arc<P>>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Active,

    /// The entry was removed from the cache and its policy detached. No policy
    /// may be published to it.
    Released,
}

/// A read-only view of a cached policy, handed to endpoints.
#[derive(Debug)]
pub struct SelectorPolicy<P>(Arc<CachedSelectorPolicy<P>>);

/// The redirect filters of the policy that was published when they were
/// requested.
#[derive(Debug)]
pub struct RedirectFilters<P>(Arc<P>);

// === impl CachedSelectorPolicy ===

impl<P: ResolvedPolicy> CachedSelectorPolicy<P> {
    pub(crate) fn new(identity: Identity) -> Self {
        Self {
            identity,
            lifecycle: Mutex::new(Lifecycle::Active),
            policy: RwLock::new(None),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Returns the currently published policy, if any.
    ///
    /// The returned policy must be treated as immutable.
    pub fn policy(&self) -> Option<Arc<P>> {
        self.policy.read().clone()
    }

    pub(crate) fn has_policy(&self) -> bool {
        self.policy.read().is_some()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock()
    }

    /// Publishes `policy`, detaching the policy it replaces.
    ///
    /// Returns true if a prior policy was detached.
    pub(crate) fn set_policy(&self, _: &MutexGuard<'_, Lifecycle>, policy: Arc<P>) -> bool {
        let prior = self.policy.write().replace(policy);
        match prior {
            Some(prior) => {
                // Release the references the prior policy holds on the selector index.
                prior.detach();
                true
            }
            None => false,
        }
    }

    /// Marks the entry released and detaches its policy, waiting for any
    /// in-flight update to complete.
    ///
    /// Returns true if a policy was detached.
    pub(crate) fn release(&self) -> bool {
        let mut lifecycle = self.lock();
        if *lifecycle == Lifecycle::Released {
            return false;
        }
        *lifecycle = Lifecycle::Released;

        let policy = self.policy.write().take();
        match policy {
            Some(policy) => {
                policy.detach();
                true
            }
            None => false,
        }
    }

    /// Computes the policy for an endpoint with this identity.
    ///
    /// The endpoint policy is distilled from the published policy on every
    /// call.
    pub fn consume(
        &self,
        owner: &dyn PolicyOwner,
        redirects: &RedirectPorts,
    ) -> Result<P::EndpointPolicy> {
        // TODO: cache the endpoint policy per owner and emit datapath deltas
        // instead of distilling it on each call.
        let policy = self.policy().ok_or(Error::NoPolicy(self.identity.id))?;
        Ok(policy.distill(owner, redirects, self.identity.is_host()))
    }

    /// Returns the filters for which redirects must exist before the policy is
    /// consumed.
    pub fn redirect_filters(&self) -> Result<RedirectFilters<P>> {
        let policy = self.policy().ok_or(Error::NoPolicy(self.identity.id))?;
        Ok(RedirectFilters(policy))
    }
}

// === impl SelectorPolicy ===

impl<P: ResolvedPolicy> SelectorPolicy<P> {
    pub(crate) fn new(entry: Arc<CachedSelectorPolicy<P>>) -> Self {
        Self(entry)
    }

    #[inline]
    pub fn redirect_filters(&self) -> Result<RedirectFilters<P>> {
        self.0.redirect_filters()
    }

    #[inline]
    pub fn consume(
        &self,
        owner: &dyn PolicyOwner,
        redirects: &RedirectPorts,
    ) -> Result<P::EndpointPolicy> {
        self.0.consume(owner, redirects)
    }
}

impl<P> Clone for SelectorPolicy<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

// === impl RedirectFilters ===

impl<P: ResolvedPolicy> RedirectFilters<P> {
    pub fn revision(&self) -> Revision {
        self.0.revision()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&L4Filter, &PerSelectorPolicy)> + '_ {
        self.0.redirect_filters()
    }
}
