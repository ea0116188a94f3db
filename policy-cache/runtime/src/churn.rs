//! Churn driver: regenerates endpoints concurrently while the repository's revision advances and
//! endpoints come and go, then checks that every selector reference was released exactly once.

use crate::{
    core::{
        AuthType, Identity, IdentityManager, Labels, NumericIdentity, PolicyOwner, Protocol,
        RedirectPorts,
    },
    index::{self, CacheMetrics, PolicyCache},
    synthetic::{LabelSelector, LocalIdentities, Rule, SelectorIndex, SyntheticRepository},
};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use rand::Rng;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

/// Proxy ports are allocated from this base, offset by the redirected port.
const PROXY_PORT_BASE: u16 = 10_000;

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub identities: u32,
    pub endpoints_per_identity: u32,
    pub workers: usize,
    pub rounds: u32,
    pub revision_bump_every: u32,
    pub removal_percent: u8,
    pub failure_percent: u8,
}

#[derive(Clone, Debug)]
pub(crate) struct ChurnMetrics {
    regenerations: Counter,
    failed_regenerations: Counter,
    endpoint_toggles: Counter,
    revision_bumps: Counter,
}

#[derive(Debug)]
struct Endpoint {
    id: u64,
    identity: Identity,
    active: Mutex<bool>,
}

type Cache = PolicyCache<SyntheticRepository>;

#[derive(Clone)]
struct Worker {
    cache: Arc<Cache>,
    repo: Arc<SyntheticRepository>,
    local: Arc<LocalIdentities>,
    endpoints: Arc<Vec<Endpoint>>,
    peers: Arc<Vec<NumericIdentity>>,
    metrics: ChurnMetrics,
    config: Config,
}

pub(crate) async fn run(config: Config, prom: &mut Registry) -> Result<()> {
    let selectors = SelectorIndex::shared();
    let identities = mk_identities(config.identities);
    for identity in &identities {
        selectors.upsert_identity(identity.id, identity.labels.clone());
    }

    let repo = Arc::new(
        SyntheticRepository::new(selectors.clone(), default_rules())
            .with_failure_percent(config.failure_percent),
    );
    let local = Arc::new(LocalIdentities::default());

    let cache_prom = prom.sub_registry_with_prefix("policy_cache");
    let cache = PolicyCache::shared(
        repo.clone(),
        Some(&*local as &dyn IdentityManager),
        CacheMetrics::register(cache_prom),
    );
    index::metrics::register(cache_prom, cache.clone());
    let metrics = ChurnMetrics::register(prom.sub_registry_with_prefix("churn"));

    let endpoints = mk_endpoints(&identities, config.endpoints_per_identity);
    for ep in &endpoints {
        local.add(&ep.identity);
    }
    info!(
        identities = identities.len(),
        endpoints = endpoints.len(),
        workers = config.workers,
        rounds = config.rounds,
        "Starting churn"
    );

    let worker = Worker {
        cache: cache.clone(),
        repo,
        local: local.clone(),
        endpoints: Arc::new(endpoints),
        peers: Arc::new(identities.iter().map(|id| id.id).collect()),
        metrics: metrics.clone(),
        config: config.clone(),
    };
    let mut workers = JoinSet::new();
    for n in 0..config.workers {
        let worker = worker.clone();
        workers.spawn_blocking(move || worker.run(n));
    }
    while let Some(res) = workers.join_next().await {
        res??;
    }

    // Remove every endpoint so that each identity's cached policy is released.
    for ep in worker.endpoints.iter() {
        let mut active = ep.active.lock();
        if *active {
            local.remove(&ep.identity);
            *active = false;
        }
    }

    info!(
        regenerations = metrics.regenerations.get(),
        failed = metrics.failed_regenerations.get(),
        toggles = metrics.endpoint_toggles.get(),
        revision_bumps = metrics.revision_bumps.get(),
        "Churn complete"
    );

    if !cache.is_empty() {
        bail!("{} identities remain cached after all endpoints were removed", cache.len());
    }
    if !local.is_empty() {
        bail!("{} local identities remain after all endpoints were removed", local.len());
    }
    if selectors.users() != 0 {
        bail!("{} selector references leaked", selectors.users());
    }
    if selectors.over_released() != 0 {
        bail!("{} selector references released twice", selectors.over_released());
    }
    Ok(())
}

fn mk_identities(n: u32) -> Vec<Identity> {
    let host = Identity::new(
        NumericIdentity::HOST,
        Labels::from([("reserved".to_string(), "host".to_string())]),
    );
    let workloads = (0..n).map(|i| {
        let tier = if i % 2 == 0 { "frontend" } else { "backend" };
        Identity::new(
            1000 + i,
            Labels::from([
                ("app".to_string(), format!("app-{i}")),
                ("tier".to_string(), tier.to_string()),
            ]),
        )
    });
    std::iter::once(host).chain(workloads).collect()
}

fn mk_endpoints(identities: &[Identity], per_identity: u32) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();
    for identity in identities {
        // The host is a single endpoint.
        let n = if identity.is_host() { 1 } else { per_identity };
        for _ in 0..n {
            endpoints.push(Endpoint {
                id: endpoints.len() as u64 + 1,
                identity: identity.clone(),
                active: Mutex::new(true),
            });
        }
    }
    endpoints
}

fn default_rules() -> Vec<Rule> {
    fn selector<const N: usize>(labels: [(&str, &str); N]) -> LabelSelector {
        labels.into_iter().collect()
    }

    vec![
        Rule {
            subject: selector([("tier", "backend")]),
            peer: selector([("tier", "frontend")]),
            port: 8080,
            protocol: Protocol::Tcp,
            l7_parser: Some("http".to_string()),
            auth: [AuthType::Spire].into_iter().collect(),
        },
        Rule {
            subject: selector([("tier", "backend")]),
            peer: LabelSelector::default(),
            port: 9090,
            protocol: Protocol::Tcp,
            l7_parser: None,
            auth: Default::default(),
        },
        Rule {
            subject: selector([("tier", "frontend")]),
            peer: selector([("tier", "backend")]),
            port: 443,
            protocol: Protocol::Tcp,
            l7_parser: None,
            auth: [AuthType::Spire].into_iter().collect(),
        },
        Rule {
            subject: LabelSelector::default(),
            peer: selector([("reserved", "host")]),
            port: 4240,
            protocol: Protocol::Tcp,
            l7_parser: None,
            auth: Default::default(),
        },
        Rule {
            subject: selector([("reserved", "host")]),
            peer: LabelSelector::default(),
            port: 53,
            protocol: Protocol::Udp,
            l7_parser: Some("dns".to_string()),
            auth: Default::default(),
        },
    ]
}

// === impl ChurnMetrics ===

impl ChurnMetrics {
    pub(crate) fn register(prom: &mut Registry) -> Self {
        let regenerations = Counter::default();
        prom.register(
            "regenerations",
            "Count of endpoint regenerations",
            regenerations.clone(),
        );

        let failed_regenerations = Counter::default();
        prom.register(
            "failed_regenerations",
            "Count of endpoint regenerations that failed to resolve policy",
            failed_regenerations.clone(),
        );

        let endpoint_toggles = Counter::default();
        prom.register(
            "endpoint_toggles",
            "Count of endpoints removed or restored",
            endpoint_toggles.clone(),
        );

        let revision_bumps = Counter::default();
        prom.register(
            "revision_bumps",
            "Count of repository revision bumps",
            revision_bumps.clone(),
        );

        Self {
            regenerations,
            failed_regenerations,
            endpoint_toggles,
            revision_bumps,
        }
    }
}

// === impl Worker ===

impl Worker {
    fn run(self, n: usize) -> Result<()> {
        let Config {
            rounds,
            revision_bump_every,
            removal_percent,
            ..
        } = self.config;
        let mut rng = rand::thread_rng();

        for round in 1..=rounds {
            if revision_bump_every > 0 && round % revision_bump_every == 0 {
                let revision = self.repo.bump_revision();
                self.metrics.revision_bumps.inc();
                trace!(worker = n, revision, "Bumped revision");
            }

            let ep = &self.endpoints[rng.gen_range(0..self.endpoints.len())];
            let mut active = ep.active.lock();

            if rng.gen_range(0..100u8) < removal_percent {
                if *active {
                    self.local.remove(&ep.identity);
                } else {
                    self.local.add(&ep.identity);
                }
                *active = !*active;
                self.metrics.endpoint_toggles.inc();
                debug!(worker = n, endpoint = ep.id, active = *active, "Toggled endpoint");
                continue;
            }

            if *active {
                let peer = self.peers[rng.gen_range(0..self.peers.len())];
                self.regenerate(ep, peer)?;
            }
        }
        Ok(())
    }

    /// Regenerates an endpoint as an agent would: update the identity's cached policy, create
    /// redirects, distill the endpoint's policy, and look up the authentication required for a
    /// peer.
    fn regenerate(&self, ep: &Endpoint, peer: NumericIdentity) -> Result<()> {
        let policy = match self.cache.update_policy(&ep.identity) {
            Ok(policy) => policy,
            Err(index::Error::Resolve { .. }) => {
                self.metrics.failed_regenerations.inc();
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        let redirects = policy
            .redirect_filters()?
            .iter()
            .filter_map(|(filter, sp)| {
                let name = sp.l7_parser.as_ref().or(sp.listener.as_ref())?;
                Some((name.clone(), PROXY_PORT_BASE.saturating_add(filter.port)))
            })
            .collect::<RedirectPorts>();

        let distilled = policy.consume(ep, &redirects)?;
        let auth = self.cache.get_auth_types(ep.identity.id, peer);
        trace!(
            endpoint = ep.id,
            revision = distilled.revision,
            redirects = distilled.redirects.len(),
            %peer,
            ?auth,
            "Regenerated endpoint"
        );
        self.metrics.regenerations.inc();
        Ok(())
    }
}

// === impl Endpoint ===

impl PolicyOwner for Endpoint {
    fn id(&self) -> u64 {
        self.id
    }
}
