use ahash::AHashMap as HashMap;
use parking_lot::{Mutex, RwLock};
use policy_cache_core::{CachedSelector, Labels, NumericIdentity, SelectorVersion};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Selects identities whose labels include all of the selector's labels. An
/// empty selector selects every identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSelector(BTreeMap<String, String>);

/// Matches label selectors against known identities and counts the resolved
/// policies referencing each selector.
///
/// Each upsert advances the index version. An identity is visible at the
/// versions starting with its latest upsert.
#[derive(Debug, Default)]
pub struct SelectorIndex {
    identities: RwLock<Identities>,
    users: Mutex<HashMap<LabelSelector, usize>>,
    over_released: AtomicUsize,
}

#[derive(Debug, Default)]
struct Identities {
    version: u64,
    by_id: HashMap<NumericIdentity, (Labels, u64)>,
}

/// A resolved policy's reference to a selector in the index.
#[derive(Debug)]
pub struct SelectorRef {
    selector: LabelSelector,
    index: Arc<SelectorIndex>,
}

// === impl LabelSelector ===

impl LabelSelector {
    pub fn matches(&self, labels: &Labels) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl<K: ToString, V: ToString> FromIterator<(K, V)> for LabelSelector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut labels = self.0.iter();
        if let Some((k, v)) = labels.next() {
            write!(f, "{k}={v}")?;
            for (k, v) in labels {
                write!(f, ",{k}={v}")?;
            }
        }
        Ok(())
    }
}

// === impl SelectorIndex ===

impl SelectorIndex {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds or relabels an identity, returning the new index version.
    pub fn upsert_identity(&self, id: NumericIdentity, labels: Labels) -> u64 {
        let mut identities = self.identities.write();
        identities.version += 1;
        let version = identities.version;
        identities.by_id.insert(id, (labels, version));
        version
    }

    pub fn version(&self) -> u64 {
        self.identities.read().version
    }

    /// Takes a reference on `selector`.
    pub fn add_user(self: &Arc<Self>, selector: &LabelSelector) -> Arc<SelectorRef> {
        *self.users.lock().entry(selector.clone()).or_default() += 1;
        Arc::new(SelectorRef {
            selector: selector.clone(),
            index: self.clone(),
        })
    }

    pub(super) fn remove_user(&self, selector: &LabelSelector) {
        let mut users = self.users.lock();
        match users.get_mut(selector) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                users.remove(selector);
            }
            None => {
                tracing::error!(%selector, "Selector released more often than referenced");
                self.record_over_release();
            }
        }
    }

    pub(super) fn record_over_release(&self) {
        self.over_released.fetch_add(1, Ordering::Relaxed);
    }

    /// The number of outstanding selector references.
    pub fn users(&self) -> usize {
        self.users.lock().values().sum()
    }

    /// The number of releases without a matching reference.
    pub fn over_released(&self) -> usize {
        self.over_released.load(Ordering::Relaxed)
    }

    fn selects(
        &self,
        selector: &LabelSelector,
        version: SelectorVersion,
        id: NumericIdentity,
    ) -> bool {
        let identities = self.identities.read();
        let Some((labels, added)) = identities.by_id.get(&id) else {
            return false;
        };
        let visible = match version {
            SelectorVersion::Latest => true,
            SelectorVersion::At(v) => *added <= v,
        };
        visible && selector.matches(labels)
    }
}

// === impl SelectorRef ===

impl SelectorRef {
    pub fn selector(&self) -> &LabelSelector {
        &self.selector
    }

    pub(super) fn release(&self) {
        self.index.remove_user(&self.selector);
    }
}

impl CachedSelector for SelectorRef {
    fn selects(&self, version: SelectorVersion, id: NumericIdentity) -> bool {
        self.index.selects(&self.selector, version, id)
    }
}
