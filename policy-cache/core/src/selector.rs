use crate::NumericIdentity;
use std::fmt;

/// Identifies a version of the shared selector index.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SelectorVersion {
    /// Whatever the index currently holds, including identities added after
    /// the policy was resolved.
    #[default]
    Latest,

    At(u64),
}

/// A peer selector held in the shared selector index.
///
/// Resolved policies reference selectors so that they keep matching newly
/// created identities; these references are released when the policy is
/// detached.
pub trait CachedSelector: fmt::Debug + Send + Sync {
    /// Indicates whether the selector matches `id` at the given index version.
    fn selects(&self, version: SelectorVersion, id: NumericIdentity) -> bool;
}
