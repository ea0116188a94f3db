use super::*;
use crate::metrics::UpdateLabels;
use maplit::btreemap;
use parking_lot::Mutex;
use policy_cache_core::{
    AuthMap, AuthType, AuthTypes, CachedSelector, Identity, IdentityManager, IdentityObserver,
    L4Filter, NumericIdentity, PerSelectorPolicy, PolicyOwner, Protocol, RedirectPorts,
    Repository, ResolvedPolicy, Revision, SelectorVersion,
};
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
    time::Duration,
};

#[test]
fn update_is_noop_at_same_revision() {
    let test = TestConfig::default();
    let id = mk_identity(1001);

    let (cip, updated) = test.cache.update_selector_policy(&id).unwrap();
    assert!(updated);
    let first = cip.policy().expect("policy must be published");

    let (cip, updated) = test.cache.update_selector_policy(&id).unwrap();
    assert!(!updated);
    let second = cip.policy().expect("policy must be published");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(test.repo.resolutions(), 1);
    assert_eq!(test.repo.detaches(), 0);
    assert_eq!(test.updates("resolved"), 1);
    assert_eq!(test.updates("up_to_date"), 1);
}

#[test]
fn revision_bump_resolves_and_detaches_prior_policy() {
    let test = TestConfig::default();
    let id = mk_identity(1001);

    let (cip, _) = test.cache.update_selector_policy(&id).unwrap();
    let first = cip.policy().unwrap();
    assert_eq!(first.revision, 1);

    test.repo.bump_revision();
    let (cip, updated) = test.cache.update_selector_policy(&id).unwrap();
    assert!(updated);
    let second = cip.policy().unwrap();
    assert_eq!(second.revision, 2);
    assert_eq!(first.detached.load(Ordering::SeqCst), 1);
    assert_eq!(second.detached.load(Ordering::SeqCst), 0);
    assert_eq!(test.repo.resolutions(), 2);
    assert_eq!(test.metrics.detaches.get(), 1);
}

#[test]
fn concurrent_updates_of_an_identity_resolve_once() {
    const UPDATERS: usize = 16;

    let test = TestConfig::with_repo(MockRepo {
        delay: Some(Duration::from_millis(20)),
        ..MockRepo::default()
    });
    let id = mk_identity(1001);
    let cache = &test.cache;
    let barrier = Barrier::new(UPDATERS);

    let updated = thread::scope(|s| {
        let handles = (0..UPDATERS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let (_, updated) = cache.update_selector_policy(&id).unwrap();
                    updated
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|updated| *updated)
            .count()
    });

    assert_eq!(updated, 1);
    assert_eq!(test.repo.resolutions(), 1);
    assert_eq!(test.repo.detaches(), 0);
    assert_eq!(test.cache.len(), 1);
}

#[test]
fn updates_of_distinct_identities_are_independent() {
    let test = TestConfig::default();
    let a = mk_identity(1001);
    let b = mk_identity(1002);

    let (cip_a, _) = test.cache.update_selector_policy(&a).unwrap();
    let (cip_b, _) = test.cache.update_selector_policy(&b).unwrap();
    assert!(!Arc::ptr_eq(&cip_a, &cip_b));
    assert_eq!(cip_a.identity(), &a);
    assert_eq!(cip_b.identity(), &b);
    assert_eq!(test.cache.len(), 2);
}

#[test]
fn delete_is_idempotent() {
    let test = TestConfig::default();
    let id = mk_identity(1002);

    let (cip, _) = test.cache.update_selector_policy(&id).unwrap();
    let policy = cip.policy().unwrap();

    assert!(test.cache.delete(&id));
    assert!(!test.cache.delete(&id));
    assert_eq!(policy.detached.load(Ordering::SeqCst), 1);
    assert_eq!(test.repo.detaches(), 1);
    assert!(test.cache.is_empty());
    assert_eq!(test.metrics.deletes.get(), 1);

    // The released entry no longer exposes a policy.
    assert!(cip.policy().is_none());
    assert!(matches!(
        cip.redirect_filters(),
        Err(Error::NoPolicy(NumericIdentity(1002)))
    ));
}

#[test]
fn delete_unresolved_entry_detaches_nothing() {
    let test = TestConfig::default();
    let id = mk_identity(1002);

    test.cache.lookup_or_create(&id);
    assert!(test.cache.delete(&id));
    assert_eq!(test.repo.detaches(), 0);
}

#[test]
fn update_after_delete_starts_a_fresh_entry() {
    let test = TestConfig::default();
    let id = mk_identity(1003);

    let (first, _) = test.cache.update_selector_policy(&id).unwrap();
    assert!(test.cache.delete(&id));

    let (second, updated) = test.cache.update_selector_policy(&id).unwrap();
    assert!(updated);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(test.repo.resolutions(), 2);
    assert_eq!(test.repo.detaches(), 1);
}

#[test]
fn no_detach_without_supersession() {
    let test = TestConfig::default();
    for id in 1001..1011 {
        test.cache.update_selector_policy(&mk_identity(id)).unwrap();
    }
    assert_eq!(test.repo.resolutions(), 10);
    assert_eq!(test.repo.detaches(), 0);
}

#[test]
fn failed_resolution_keeps_prior_policy() {
    let test = TestConfig::default();
    let id = mk_identity(1001);

    let (cip, _) = test.cache.update_selector_policy(&id).unwrap();
    let prior = cip.policy().unwrap();

    test.repo.bump_revision();
    test.repo.fail.store(true, Ordering::SeqCst);
    let err = test.cache.update_selector_policy(&id).unwrap_err();
    assert!(matches!(
        err,
        Error::Resolve {
            identity: NumericIdentity(1001),
            ..
        }
    ));
    assert!(Arc::ptr_eq(&prior, &cip.policy().unwrap()));
    assert_eq!(prior.detached.load(Ordering::SeqCst), 0);
    assert_eq!(test.updates("failed"), 1);

    // Once the repository recovers, the next update publishes a new policy.
    test.repo.fail.store(false, Ordering::SeqCst);
    let (_, updated) = test.cache.update_selector_policy(&id).unwrap();
    assert!(updated);
    assert_eq!(cip.policy().unwrap().revision, 2);
    assert_eq!(prior.detached.load(Ordering::SeqCst), 1);
}

#[test]
fn consume_requires_resolved_policy() {
    let test = TestConfig::default();
    let id = mk_identity(1001);

    let cip = test.cache.lookup_or_create(&id);
    let err = cip
        .consume(&MockOwner(7), &RedirectPorts::default())
        .unwrap_err();
    assert!(matches!(err, Error::NoPolicy(NumericIdentity(1001))));

    test.repo.fail.store(true, Ordering::SeqCst);
    test.cache
        .update_policy(&id)
        .expect_err("resolution must fail");
    assert!(cip.redirect_filters().is_err());
}

#[test]
fn consume_distills_current_policy() {
    let test = TestConfig::default();
    let redirects: RedirectPorts = [("http".to_string(), 15001)].into_iter().collect();

    let policy = test.cache.update_policy(&mk_identity(1001)).unwrap();
    let distilled = policy.consume(&MockOwner(7), &redirects).unwrap();
    assert_eq!(
        distilled,
        Distilled {
            owner: 7,
            revision: 1,
            is_host: false,
            redirects: vec![(80, 15001)],
        }
    );

    // Consumers observe policy updates through the same view.
    test.repo.bump_revision();
    test.cache.update_policy(&mk_identity(1001)).unwrap();
    let distilled = policy.consume(&MockOwner(7), &redirects).unwrap();
    assert_eq!(distilled.revision, 2);
}

#[test]
fn consume_marks_host_identity() {
    let test = TestConfig::default();
    let host = Identity::new(NumericIdentity::HOST, btreemap! {
        "reserved".to_string() => "host".to_string(),
    });

    let policy = test.cache.update_policy(&host).unwrap();
    let distilled = policy
        .consume(&MockOwner(1), &RedirectPorts::default())
        .unwrap();
    assert!(distilled.is_host);
    assert!(distilled.redirects.is_empty());
}

#[test]
fn redirect_filters_hold_policy_at_call_time() {
    let test = TestConfig::default();
    let id = mk_identity(1001);

    let policy = test.cache.update_policy(&id).unwrap();
    let filters = policy.redirect_filters().unwrap();
    assert_eq!(filters.revision(), 1);
    let ports = filters.iter().map(|(f, _)| f.port).collect::<Vec<_>>();
    assert_eq!(ports, vec![80]);
    // Iteration can be repeated.
    assert_eq!(filters.iter().count(), 1);

    test.repo.bump_revision();
    test.cache.update_policy(&id).unwrap();
    assert_eq!(filters.revision(), 1);
    assert_eq!(policy.redirect_filters().unwrap().revision(), 2);
}

#[test]
fn auth_types_union_of_matching_selectors() {
    let remote = NumericIdentity(2001);
    let selects_remote = MockSelector::new([remote]);
    let selects_other = MockSelector::new([NumericIdentity(2002)]);
    let repo = MockRepo::default();
    *repo.auth.lock() = [
        (
            selects_remote.clone() as Arc<dyn CachedSelector>,
            auth_types([AuthType::Spire]),
        ),
        (
            selects_other.clone() as Arc<dyn CachedSelector>,
            auth_types([AuthType::AlwaysFail, AuthType::Disabled]),
        ),
    ]
    .into_iter()
    .collect();
    let test = TestConfig::with_repo(repo);

    test.cache.update_selector_policy(&mk_identity(1001)).unwrap();
    assert_eq!(
        test.cache.get_auth_types(NumericIdentity(1001), remote),
        auth_types([AuthType::Spire])
    );
    assert_eq!(
        test.cache
            .get_auth_types(NumericIdentity(1001), NumericIdentity(2002)),
        auth_types([AuthType::AlwaysFail, AuthType::Disabled])
    );
    assert!(test
        .cache
        .get_auth_types(NumericIdentity(1001), NumericIdentity(2003))
        .is_empty());
}

#[test]
fn auth_types_skip_selectors_that_add_nothing() {
    let remote = NumericIdentity(2001);
    let first = MockSelector::new([remote]);
    let second = MockSelector::new([remote]);
    let repo = MockRepo::default();
    *repo.auth.lock() = [
        (
            first.clone() as Arc<dyn CachedSelector>,
            auth_types([AuthType::Spire]),
        ),
        (
            second.clone() as Arc<dyn CachedSelector>,
            auth_types([AuthType::Spire]),
        ),
    ]
    .into_iter()
    .collect();
    let test = TestConfig::with_repo(repo);

    test.cache.update_selector_policy(&mk_identity(1001)).unwrap();
    assert_eq!(
        test.cache.get_auth_types(NumericIdentity(1001), remote),
        auth_types([AuthType::Spire])
    );
    assert_eq!(first.checks.load(Ordering::SeqCst), 1);
    assert_eq!(second.checks.load(Ordering::SeqCst), 0);
}

#[test]
fn auth_types_of_unknown_identity_are_empty() {
    let test = TestConfig::default();
    assert!(test
        .cache
        .get_auth_types(NumericIdentity(4242), NumericIdentity(1))
        .is_empty());

    // An entry that never resolved has no policy to enforce, either.
    test.cache.lookup_or_create(&mk_identity(4242));
    assert!(test
        .cache
        .get_auth_types(NumericIdentity(4242), NumericIdentity(1))
        .is_empty());
}

#[test]
fn identity_removal_deletes_entry() {
    let _tracing = init_tracing();
    let repo = Arc::new(MockRepo::default());
    let idmgr = MockIdentityManager::default();
    let cache = PolicyCache::shared(
        repo.clone(),
        Some(&idmgr as &dyn IdentityManager),
        CacheMetrics::default(),
    );
    let id = mk_identity(1001);

    idmgr.added(&id);
    assert!(cache.is_empty(), "additions must not populate the cache");

    cache.update_selector_policy(&id).unwrap();
    idmgr.removed(&id);
    assert!(cache.is_empty());
    assert_eq!(repo.detaches(), 1);

    // Removing an identity the cache does not know about is harmless.
    idmgr.removed(&mk_identity(1002));
    assert_eq!(repo.detaches(), 1);
}

#[test]
fn update_of_deleted_entry_moves_to_fresh_entry() {
    let test = TestConfig::default();
    let id = mk_identity(1001);

    let (stale, _) = test.cache.update_selector_policy(&id).unwrap();
    let prior = stale.policy().unwrap();
    assert!(test.cache.delete(&id));

    let (fresh, updated) = test.cache.update_from(stale.clone()).unwrap();
    assert!(updated);
    assert!(!Arc::ptr_eq(&stale, &fresh));
    assert!(stale.policy().is_none());
    assert_eq!(prior.detached.load(Ordering::SeqCst), 1);
    assert_eq!(test.repo.resolutions(), 2);
    assert_eq!(test.repo.detaches(), 1);
    assert_eq!(test.cache.len(), 1);
    assert!(Arc::ptr_eq(&test.cache.get(id.id).unwrap(), &fresh));
}

/// An updater waiting on an entry's lock while the entry is deleted must not publish into the
/// released entry.
#[test]
fn update_waiting_on_deleted_entry_retries() {
    let gate = Arc::new(Gate {
        entered: Barrier::new(2),
        release: Barrier::new(2),
    });
    let test = TestConfig::with_repo(MockRepo::gated(gate.clone()));
    let cache = &test.cache;
    let id = mk_identity(1001);

    let (first, stale, fresh) = thread::scope(|s| {
        // Holds the entry's lock until the gate is released.
        let first = s.spawn(|| cache.update_selector_policy(&id).unwrap());
        gate.entered.wait();
        let stale = cache.get(id.id).expect("entry must be cached");

        let delete = s.spawn(|| cache.delete(&id));
        while cache.get(id.id).is_some() {
            thread::yield_now();
        }
        // Let the delete block on the entry's lock before the updater does.
        thread::sleep(Duration::from_millis(50));

        let waiting = s.spawn({
            let stale = stale.clone();
            move || cache.update_from(stale).unwrap()
        });
        thread::sleep(Duration::from_millis(50));
        gate.release.wait();

        let (first, _) = first.join().unwrap();
        assert!(delete.join().unwrap());
        let (fresh, updated) = waiting.join().unwrap();
        assert!(updated);
        (first, stale, fresh)
    });

    assert!(Arc::ptr_eq(&first, &stale));
    assert!(!Arc::ptr_eq(&stale, &fresh));
    assert!(stale.policy().is_none());
    assert_eq!(fresh.policy().unwrap().detached.load(Ordering::SeqCst), 0);
    assert_eq!(test.repo.resolutions(), 2);
    assert_eq!(test.repo.detaches(), 1);
    assert_eq!(test.cache.len(), 1);
    assert!(Arc::ptr_eq(&test.cache.get(id.id).unwrap(), &fresh));
}

/// Races updates, revision bumps, and deletions, checking that every resolved policy is detached
/// exactly once when the cache is finally emptied.
#[test]
fn deletes_racing_updates_detach_each_policy_once() {
    const UPDATERS: usize = 8;
    const ROUNDS: u32 = 200;

    let test = TestConfig::default();
    let (cache, repo) = (&test.cache, &test.repo);
    let identities = (1001..1005).map(mk_identity).collect::<Vec<_>>();
    let barrier = Barrier::new(UPDATERS + 2);

    thread::scope(|s| {
        for _ in 0..UPDATERS {
            s.spawn(|| {
                barrier.wait();
                for i in 0..ROUNDS {
                    let id = &identities[i as usize % identities.len()];
                    cache.update_selector_policy(id).unwrap();
                }
            });
        }
        s.spawn(|| {
            barrier.wait();
            for _ in 0..ROUNDS {
                repo.bump_revision();
                thread::yield_now();
            }
        });
        s.spawn(|| {
            barrier.wait();
            for i in 0..ROUNDS {
                cache.delete(&identities[i as usize % identities.len()]);
                thread::yield_now();
            }
        });
    });

    for id in &identities {
        test.cache.delete(id);
    }
    assert!(test.cache.is_empty());
    assert_eq!(test.repo.detaches(), test.repo.resolutions());
    assert_eq!(test.metrics.detaches.get() as usize, test.repo.resolutions());
}

#[test]
fn registered_metrics() {
    use prometheus_client::{encoding::text::encode, registry::Registry};

    let mut prom = Registry::default();
    let repo = Arc::new(MockRepo::default());
    let cache = PolicyCache::shared(repo.clone(), None, CacheMetrics::register(&mut prom));
    metrics::register(&mut prom, cache.clone());

    cache.update_selector_policy(&mk_identity(1001)).unwrap();
    cache.update_selector_policy(&mk_identity(1001)).unwrap();
    cache.lookup_or_create(&mk_identity(1002));

    let mut text = String::new();
    encode(&mut text, &prom).unwrap();
    assert!(text.contains("updates_total{result=\"resolved\"} 1\n"), "{text}");
    assert!(text.contains("updates_total{result=\"up_to_date\"} 1\n"), "{text}");
    assert!(text.contains("\nentries 2\n"), "{text}");
    assert!(text.contains("\nresolved_entries 1\n"), "{text}");
}

// === Test helpers ===

struct TestConfig {
    cache: Arc<PolicyCache<MockRepo>>,
    repo: Arc<MockRepo>,
    metrics: CacheMetrics,
    _tracing: tracing::subscriber::DefaultGuard,
}

impl TestConfig {
    fn with_repo(repo: MockRepo) -> Self {
        let _tracing = init_tracing();
        let repo = Arc::new(repo);
        let metrics = CacheMetrics::default();
        let cache = PolicyCache::shared(repo.clone(), None, metrics.clone());
        Self {
            cache,
            repo,
            metrics,
            _tracing,
        }
    }

    fn updates(&self, result: &'static str) -> u64 {
        self.metrics
            .updates
            .get_or_create(&UpdateLabels { result })
            .get()
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::with_repo(MockRepo::default())
    }
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

fn mk_identity(id: u32) -> Identity {
    Identity::new(id, btreemap! {
        "app".to_string() => format!("app-{id}"),
        "ns".to_string() => "default".to_string(),
    })
}

fn auth_types(types: impl IntoIterator<Item = AuthType>) -> AuthTypes {
    types.into_iter().collect()
}

#[derive(Debug)]
struct MockRepo {
    revision: AtomicU64,
    resolutions: AtomicUsize,
    detaches: Arc<AtomicUsize>,
    fail: AtomicBool,
    delay: Option<Duration>,
    gate: Mutex<Option<Arc<Gate>>>,
    auth: Mutex<AuthMap>,
}

/// Holds the next resolution until the test releases it.
#[derive(Debug)]
struct Gate {
    entered: Barrier,
    release: Barrier,
}

impl Default for MockRepo {
    fn default() -> Self {
        Self {
            revision: AtomicU64::new(1),
            resolutions: AtomicUsize::new(0),
            detaches: Arc::new(AtomicUsize::new(0)),
            fail: AtomicBool::new(false),
            delay: None,
            gate: Mutex::new(None),
            auth: Mutex::new(AuthMap::default()),
        }
    }
}

impl MockRepo {
    fn gated(gate: Arc<Gate>) -> Self {
        Self {
            gate: Mutex::new(Some(gate)),
            ..Self::default()
        }
    }

    fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }

    fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
}

impl Repository for MockRepo {
    type Policy = MockPolicy;

    fn revision(&self) -> Revision {
        self.revision.load(Ordering::SeqCst)
    }

    fn resolve_policy(&self, identity: &Identity) -> anyhow::Result<MockPolicy> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.entered.wait();
            gate.release.wait();
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("unresolvable selector in policy for {identity}");
        }
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        Ok(MockPolicy {
            revision: self.revision(),
            auth: self.auth.lock().clone(),
            filters: vec![
                (
                    L4Filter {
                        port: 80,
                        protocol: Protocol::Tcp,
                        ingress: true,
                    },
                    PerSelectorPolicy {
                        l7_parser: Some("http".to_string()),
                        ..Default::default()
                    },
                ),
                (
                    L4Filter {
                        port: 443,
                        protocol: Protocol::Tcp,
                        ingress: true,
                    },
                    PerSelectorPolicy::default(),
                ),
            ],
            detached: AtomicUsize::new(0),
            repo_detaches: self.detaches.clone(),
        })
    }
}

#[derive(Debug)]
struct MockPolicy {
    revision: Revision,
    auth: AuthMap,
    filters: Vec<(L4Filter, PerSelectorPolicy)>,
    detached: AtomicUsize,
    repo_detaches: Arc<AtomicUsize>,
}

#[derive(Debug, PartialEq, Eq)]
struct Distilled {
    owner: u64,
    revision: Revision,
    is_host: bool,
    redirects: Vec<(u16, u16)>,
}

impl ResolvedPolicy for MockPolicy {
    type EndpointPolicy = Distilled;

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
    ) -> Distilled {
        let redirects = self
            .redirect_filters()
            .filter_map(|(f, sp)| {
                let parser = sp.l7_parser.as_ref()?;
                Some((f.port, *redirects.get(parser)?))
            })
            .collect();
        Distilled {
            owner: owner.id(),
            revision: self.revision,
            is_host,
            redirects,
        }
    }

    fn detach(&self) {
        let prior = self.detached.fetch_add(1, Ordering::SeqCst);
        assert_eq!(prior, 0, "policy detached more than once");
        self.repo_detaches.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct MockSelector {
    selected: BTreeSet<NumericIdentity>,
    checks: AtomicUsize,
}

impl MockSelector {
    fn new(selected: impl IntoIterator<Item = NumericIdentity>) -> Arc<Self> {
        Arc::new(Self {
            selected: selected.into_iter().collect(),
            checks: AtomicUsize::new(0),
        })
    }
}

impl CachedSelector for MockSelector {
    fn selects(&self, version: SelectorVersion, id: NumericIdentity) -> bool {
        assert_eq!(version, SelectorVersion::Latest);
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.selected.contains(&id)
    }
}

struct MockOwner(u64);

impl PolicyOwner for MockOwner {
    fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct MockIdentityManager(Mutex<Vec<Arc<dyn IdentityObserver>>>);

impl MockIdentityManager {
    fn added(&self, identity: &Identity) {
        for observer in self.0.lock().iter() {
            observer.local_identity_added(identity);
        }
    }

    fn removed(&self, identity: &Identity) {
        for observer in self.0.lock().iter() {
            observer.local_identity_removed(identity);
        }
    }
}

impl IdentityManager for MockIdentityManager {
    fn subscribe(&self, observer: Arc<dyn IdentityObserver>) {
        self.0.lock().push(observer);
    }
}
