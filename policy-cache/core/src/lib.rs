//! Contracts shared between the selector policy cache and its collaborators.
//!
//! The cache never computes policy itself. A [`Repository`] resolves a
//! [`ResolvedPolicy`] for an [`Identity`]; the resolved policy holds references
//! into a shared selector index (via [`CachedSelector`]s) until it is detached.
//! Identity lifecycle events reach the cache through an [`IdentityManager`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod auth;
mod identity;
mod policy;
mod repository;
mod selector;

pub use self::{
    auth::{AuthType, AuthTypes, InvalidAuthType},
    identity::{Identity, IdentityManager, IdentityObserver, Labels, NumericIdentity},
    policy::{
        AuthMap, L4Filter, PerSelectorPolicy, PolicyOwner, Protocol, RedirectPorts,
        ResolvedPolicy, Revision,
    },
    repository::Repository,
    selector::{CachedSelector, SelectorVersion},
};
