//! Selector Policy Cache
//!
//! Holds the most recently resolved policy for each security identity used by a local endpoint, so
//! that endpoint regeneration, datapath program generation, and authentication lookups can share a
//! single resolution per identity:
//!
//! - The [`PolicyCache`] maps each identity to a [`CachedSelectorPolicy`]. Entries are created
//!   lazily, the first time an endpoint with that identity updates its policy, and removed when the
//!   identity manager reports that no local endpoint uses the identity anymore.
//! - Each entry holds an immutable resolved policy. An update only re-resolves the policy when the
//!   repository's revision has advanced past the cached policy's revision. The new policy is
//!   published with a single swap and the superseded policy is detached from the selector index.
//!
//! ```text
//! [ PolicyCache ] -> [ CachedSelectorPolicy ] -> [ ResolvedPolicy ] -> [ selector index ]
//! ```
//!
//! Two locks are involved, and neither is held while the other is being acquired in a blocking
//! way. The registry lock guards only the shape of the identity map. Each entry's own lock
//! serializes revision checks, resolution, and release for that identity; it may be held for the
//! duration of a resolution, but only blocks other updates of the same identity. Readers load the
//! published policy without waiting on either.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod entry;
pub mod metrics;

#[cfg(test)]
mod tests;

pub use self::{
    cache::PolicyCache,
    entry::{CachedSelectorPolicy, RedirectFilters, SelectorPolicy},
    metrics::CacheMetrics,
};
use policy_cache_core::NumericIdentity;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The repository could not produce a policy. Any previously cached policy remains in place.
    #[error("failed to resolve policy for identity {identity}")]
    Resolve {
        identity: NumericIdentity,
        #[source]
        source: anyhow::Error,
    },

    /// No policy has been published for the identity, either because it was never successfully
    /// resolved or because it was released.
    #[error("no policy resolved for identity {0}")]
    NoPolicy(NumericIdentity),
}
