use super::{LabelSelector, SelectorIndex, SelectorRef};
use anyhow::{bail, Result};
use parking_lot::RwLock;
use policy_cache_core::{
    AuthMap, AuthTypes, CachedSelector, Identity, L4Filter, PerSelectorPolicy, PolicyOwner,
    Protocol, RedirectPorts, Repository, ResolvedPolicy, Revision,
};
use rand::Rng;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

/// Allows ingress from peers matching `peer` to subjects matching `subject`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub subject: LabelSelector,
    pub peer: LabelSelector,
    pub port: u16,
    pub protocol: Protocol,
    pub l7_parser: Option<String>,
    pub auth: AuthTypes,
}

/// A rule set with a revision counter.
#[derive(Debug)]
pub struct SyntheticRepository {
    index: Arc<SelectorIndex>,
    rules: RwLock<Vec<Rule>>,
    revision: AtomicU64,
    failure_percent: u8,
}

#[derive(Debug)]
pub struct SyntheticPolicy {
    revision: Revision,
    filters: Vec<(L4Filter, PerSelectorPolicy)>,
    auth: AuthMap,
    selectors: Vec<Arc<SelectorRef>>,
    index: Arc<SelectorIndex>,
    detached: AtomicBool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticEndpointPolicy {
    pub endpoint: u64,
    pub revision: Revision,
    pub is_host: bool,

    /// Filters redirected to a proxy, with the proxy port.
    pub redirects: Vec<(L4Filter, u16)>,

    /// Filters without a redirect.
    pub allowed: Vec<L4Filter>,
}

// === impl SyntheticRepository ===

impl SyntheticRepository {
    pub fn new(index: Arc<SelectorIndex>, rules: Vec<Rule>) -> Self {
        Self {
            index,
            rules: RwLock::new(rules),
            revision: AtomicU64::new(1),
            failure_percent: 0,
        }
    }

    /// Fails the given percentage of resolutions.
    pub fn with_failure_percent(mut self, percent: u8) -> Self {
        self.failure_percent = percent.min(100);
        self
    }

    pub fn set_rules(&self, rules: Vec<Rule>) {
        let mut current = self.rules.write();
        *current = rules;
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    /// Advances the revision without changing any rules.
    pub fn bump_revision(&self) -> Revision {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Repository for SyntheticRepository {
    type Policy = SyntheticPolicy;

    fn revision(&self) -> Revision {
        self.revision.load(Ordering::SeqCst)
    }

    fn resolve_policy(&self, identity: &Identity) -> Result<SyntheticPolicy> {
        let rules = self.rules.read();
        let revision = self.revision();

        if self.failure_percent > 0
            && rand::thread_rng().gen_range(0..100u8) < self.failure_percent
        {
            bail!("injected resolution failure for identity {}", identity.id);
        }

        let mut filters = Vec::new();
        let mut auth = Vec::new();
        let mut selectors = Vec::new();
        for rule in rules.iter().filter(|r| r.subject.matches(&identity.labels)) {
            let selector = self.index.add_user(&rule.peer);
            filters.push((
                L4Filter {
                    port: rule.port,
                    protocol: rule.protocol,
                    ingress: true,
                },
                PerSelectorPolicy {
                    l7_parser: rule.l7_parser.clone(),
                    auth: (!rule.auth.is_empty()).then(|| rule.auth.clone()),
                    ..Default::default()
                },
            ));
            if !rule.auth.is_empty() {
                auth.push((selector.clone() as Arc<dyn CachedSelector>, rule.auth.clone()));
            }
            selectors.push(selector);
        }

        Ok(SyntheticPolicy {
            revision,
            filters,
            auth: auth.into_iter().collect(),
            selectors,
            index: self.index.clone(),
            detached: AtomicBool::new(false),
        })
    }
}

// === impl SyntheticPolicy ===

impl SyntheticPolicy {
    pub fn selectors(&self) -> impl Iterator<Item = &LabelSelector> + '_ {
        self.selectors.iter().map(|s| s.selector())
    }
}

impl ResolvedPolicy for SyntheticPolicy {
    type EndpointPolicy = SyntheticEndpointPolicy;

    fn revision(&self) -> Revision {
        self.revision
    }

    fn auth_map(&self) -> &AuthMap {
        &self.auth
    }

    fn redirect_filters(&self) -> impl Iterator<Item = (&L4Filter, &PerSelectorPolicy)> + '_ {
        self.filters
            .iter()
            .filter(|(_, sp)| sp.is_redirect())
            .map(|(f, sp)| (f, sp))
    }

    fn distill(
        &self,
        owner: &dyn PolicyOwner,
        redirects: &RedirectPorts,
        is_host: bool,
    ) -> SyntheticEndpointPolicy {
        let mut policy = SyntheticEndpointPolicy {
            endpoint: owner.id(),
            revision: self.revision,
            is_host,
            redirects: Vec::new(),
            allowed: Vec::new(),
        };
        for (filter, sp) in &self.filters {
            let port = sp
                .l7_parser
                .as_ref()
                .or(sp.listener.as_ref())
                .and_then(|name| redirects.get(name));
            match port {
                Some(port) => policy.redirects.push((filter.clone(), *port)),
                None => {
                    if sp.is_redirect() {
                        tracing::debug!(endpoint = owner.id(), port = filter.port, "Missing redirect");
                    }
                    policy.allowed.push(filter.clone());
                }
            }
        }
        policy
    }

    fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            tracing::error!(revision = self.revision, "Policy detached more than once");
            self.index.record_over_release();
            return;
        }
        for selector in &self.selectors {
            selector.release();
        }
    }
}
