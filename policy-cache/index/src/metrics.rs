use crate::PolicyCache;
use policy_cache_core::Repository;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::{fmt, sync::Arc};

/// Counts cache operations.
#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    pub(crate) updates: Family<UpdateLabels, Counter>,
    pub(crate) detaches: Counter,
    pub(crate) deletes: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct UpdateLabels {
    pub(crate) result: &'static str,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum UpdateResult {
    Resolved,
    UpToDate,
    Failed,
}

struct Instrumented<R: Repository>(Arc<PolicyCache<R>>);

/// Registers gauges describing the cache's contents.
pub fn register<R: Repository>(reg: &mut Registry, cache: Arc<PolicyCache<R>>) {
    reg.register_collector(Box::new(Instrumented(cache)));
}

// === impl CacheMetrics ===

impl CacheMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let updates = Family::default();
        prom.register(
            "updates",
            "Count of policy updates by result",
            updates.clone(),
        );

        let detaches = Counter::default();
        prom.register(
            "detaches",
            "Count of resolved policies detached from the selector index",
            detaches.clone(),
        );

        let deletes = Counter::default();
        prom.register(
            "deletes",
            "Count of identities removed from the cache",
            deletes.clone(),
        );

        Self {
            updates,
            detaches,
            deletes,
        }
    }

    pub(crate) fn update(&self, result: UpdateResult) {
        self.updates
            .get_or_create(&UpdateLabels {
                result: result.as_str(),
            })
            .inc();
    }
}

// === impl UpdateResult ===

impl UpdateResult {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::UpToDate => "up_to_date",
            Self::Failed => "failed",
        }
    }
}

// === impl Instrumented ===

impl<R: Repository> Collector for Instrumented<R> {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), fmt::Error> {
        let (entries, resolved) = self.0.sizes();

        let entries_encoder = encoder.encode_descriptor(
            "entries",
            "The number of identities in the cache",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(entries as i64).encode(entries_encoder)?;

        let resolved_encoder = encoder.encode_descriptor(
            "resolved_entries",
            "The number of identities with a resolved policy",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(resolved as i64).encode(resolved_encoder)?;

        Ok(())
    }
}

impl<R: Repository> fmt::Debug for Instrumented<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Instrumented").field(&self.0).finish()
    }
}
