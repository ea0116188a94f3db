use crate::{AuthTypes, CachedSelector};
use ahash::AHashMap as HashMap;
use std::{fmt, sync::Arc};

/// A policy repository revision. Revisions increase monotonically.
pub type Revision = u64;

/// Maps a redirect (listener) name to the proxy port allocated for it.
pub type RedirectPorts = HashMap<String, u16>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    Any,
}

/// A port-level filter in a resolved policy.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct L4Filter {
    pub port: u16,
    pub protocol: Protocol,
    pub ingress: bool,
}

/// The policy applied to peers matched by a single selector on an
/// [`L4Filter`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PerSelectorPolicy {
    /// An explicitly configured proxy listener.
    pub listener: Option<String>,

    /// The L7 protocol parser traffic is redirected to, if any.
    pub l7_parser: Option<String>,

    /// Authentication required of matched peers.
    pub auth: Option<AuthTypes>,

    pub is_deny: bool,
}

/// Pairs of peer selectors and the authentication they require.
#[derive(Clone, Debug, Default)]
pub struct AuthMap(Vec<(Arc<dyn CachedSelector>, AuthTypes)>);

/// An endpoint consuming resolved policy.
pub trait PolicyOwner {
    fn id(&self) -> u64;
}

/// An immutable policy resolved by a [`crate::Repository`] for a single
/// identity.
///
/// A resolved policy references selectors in the shared selector index until
/// it is detached. Owners must call [`ResolvedPolicy::detach`] exactly once,
/// when the policy is superseded or discarded.
pub trait ResolvedPolicy: fmt::Debug + Send + Sync + 'static {
    /// The per-endpoint policy produced by distillation.
    type EndpointPolicy;

    /// The repository revision this policy was resolved at.
    fn revision(&self) -> Revision;

    /// The authentication required of peers, by peer selector.
    fn auth_map(&self) -> &AuthMap;

    /// Iterates the filters that require a proxy redirect.
    fn redirect_filters(&self) -> impl Iterator<Item = (&L4Filter, &PerSelectorPolicy)> + '_;

    /// Computes an endpoint's concrete policy.
    fn distill(
        &self,
        owner: &dyn PolicyOwner,
        redirects: &RedirectPorts,
        is_host: bool,
    ) -> Self::EndpointPolicy;

    /// Releases this policy's references into the selector index.
    fn detach(&self);
}

// === impl PerSelectorPolicy ===

impl PerSelectorPolicy {
    pub fn is_redirect(&self) -> bool {
        self.l7_parser.is_some() || self.listener.is_some()
    }
}

// === impl AuthMap ===

impl AuthMap {
    pub fn iter(&self) -> impl Iterator<Item = (&dyn CachedSelector, &AuthTypes)> + '_ {
        self.0.iter().map(|(cs, types)| (&**cs, types))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Arc<dyn CachedSelector>, AuthTypes)> for AuthMap {
    fn from_iter<I: IntoIterator<Item = (Arc<dyn CachedSelector>, AuthTypes)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
