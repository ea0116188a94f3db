//! Synthetic collaborators for exercising the policy cache without a real
//! policy repository.
//!
//! Rules select subjects and peers by exact label matches. Resolving a policy
//! takes a reference on each peer selector in a shared [`SelectorIndex`], which
//! counts its users so that leaked or doubly released references can be
//! detected once every identity has been removed.

mod identities;
mod repository;
mod selectors;


pub use self::{
    identities::LocalIdentities,
    repository::{Rule, SyntheticEndpointPolicy, SyntheticPolicy, SyntheticRepository},
    selectors::{LabelSelector, SelectorIndex, SelectorRef},
};
