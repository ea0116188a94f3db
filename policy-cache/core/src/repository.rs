use crate::{Identity, ResolvedPolicy, Revision};
use anyhow::Result;

/// Resolves policy from the rules currently known to the node.
///
/// Implementations synchronize their own rule state. Callers must hold the
/// repository in a state that is safe for reading rules (e.g. a read lock on
/// its rule set) for the duration of a cache update, so that the revision
/// observed by the cache and the rules used for resolution agree.
pub trait Repository: Send + Sync + 'static {
    type Policy: ResolvedPolicy;

    /// The current repository revision.
    fn revision(&self) -> Revision;

    /// Computes the policy that applies to `identity` at the current revision.
    fn resolve_policy(&self, identity: &Identity) -> Result<Self::Policy>;
}
