use ringwatch_cluster::Dispatcher;
use ringwatch_common::fingerprint::Fingerprint;
use ringwatch_common::stats::{add, incr, Stats};
use ringwatch_common::types::{parse_tags, sorted_tag_pairs, MetricPoint, ALIAS_TAG, IDENT_TAG};
use ringwatch_storage::ConfigStore;
use serde::{Deserialize, Serialize};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A point as pushed by producers, before enrichment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestPoint {
    pub metric: String,
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub value: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngestError {
    #[error("Ingest: metric name is empty")]
    EmptyMetric,

    #[error("Ingest: timestamp {ts} is {offset}s away from now, max {max}s")]
    TimestampOutOfRange { ts: i64, offset: u64, max: u64 },

    #[error("Ingest: value of {metric} is not finite")]
    NonFiniteValue { metric: String },
}

/// Result of one ingest batch. Valid points are routed even when others
/// were rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestOutcome {
    pub accepted: usize,
    pub rejected: usize,
    pub first_error: Option<IngestError>,
}

impl IngestOutcome {
    pub fn into_result(self) -> Result<usize, IngestError> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(self.accepted),
        }
    }
}

struct CacheEntry {
    tags: Arc<HashMap<String, String>>,
    fetched_at: Instant,
}

/// Bounded LRU of host-level tags keyed by ident, backed by the `target`
/// table.
pub struct IdentityCache {
    store: Arc<dyn ConfigStore>,
    ttl: Duration,
    inner: Mutex<LruCache<String, CacheEntry>>,
    stats: Arc<Stats>,
}

impl IdentityCache {
    pub fn new(store: Arc<dyn ConfigStore>, capacity: usize, ttl: Duration, stats: Arc<Stats>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            ttl,
            inner: Mutex::new(LruCache::new(capacity)),
            stats,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Host tags of `ident`; empty when the host is unknown or the store is
    /// unreachable.
    pub fn host_tags(&self, ident: &str) -> Arc<HashMap<String, String>> {
        if ident.is_empty() {
            return Arc::new(HashMap::new());
        }
        if let Some(entry) = self.lock().get(ident) {
            if entry.fetched_at.elapsed() < self.ttl {
                return entry.tags.clone();
            }
        }

        match self.store.get_target(ident) {
            Ok(row) => {
                let tags = Arc::new(row.map(|r| parse_tags(&r.tags)).unwrap_or_default());
                self.lock().put(
                    ident.to_string(),
                    CacheEntry {
                        tags: tags.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                tags
            }
            Err(e) => {
                incr(&self.stats.store_errors);
                tracing::debug!(ident, error = %e, "Target lookup failed, ingesting without host tags");
                // A stale entry beats none while the store is down.
                self.lock()
                    .get(ident)
                    .map(|entry| entry.tags.clone())
                    .unwrap_or_default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validates, enriches and routes pushed points.
pub struct Ingest {
    max_offset: u64,
    identities: IdentityCache,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<Stats>,
}

impl Ingest {
    pub fn new(
        max_offset: Duration,
        identities: IdentityCache,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            max_offset: max_offset.as_secs(),
            identities,
            dispatcher,
            stats,
        }
    }

    fn validate(&self, point: &IngestPoint, now: i64) -> Result<(), IngestError> {
        if point.metric.trim().is_empty() {
            return Err(IngestError::EmptyMetric);
        }
        if !point.value.is_finite() {
            return Err(IngestError::NonFiniteValue {
                metric: point.metric.clone(),
            });
        }
        let offset = point.timestamp.abs_diff(now);
        if self.max_offset > 0 && offset > self.max_offset {
            return Err(IngestError::TimestampOutOfRange {
                ts: point.timestamp,
                offset,
                max: self.max_offset,
            });
        }
        Ok(())
    }

    /// Turns a validated point into its routed form.
    pub fn enrich(&self, point: IngestPoint) -> MetricPoint {
        let IngestPoint {
            metric,
            mut ident,
            mut alias,
            mut tags,
            value,
            timestamp,
        } = point;

        if let Some(v) = tags.remove(IDENT_TAG) {
            if ident.is_empty() {
                ident = v;
            }
        }
        if let Some(v) = tags.remove(ALIAS_TAG) {
            if alias.is_empty() {
                alias = v;
            }
        }

        // Point tags win over host tags.
        for (k, v) in self.identities.host_tags(&ident).iter() {
            tags.entry(k.clone()).or_insert_with(|| v.clone());
        }

        let tags_sorted = sorted_tag_pairs(&tags);
        let fingerprint = Fingerprint::compute(&ident, &metric, &tags_sorted);
        MetricPoint {
            ident,
            alias,
            metric,
            tags,
            value,
            timestamp,
            tags_sorted,
            fingerprint,
        }
    }

    /// Processes a whole batch, routing every valid point and reporting the
    /// first rejection.
    pub async fn ingest(&self, batch: Vec<IngestPoint>, now: i64) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        let mut routed = Vec::with_capacity(batch.len());
        add(&self.stats.points_received, batch.len() as u64);

        for point in batch {
            match self.validate(&point, now) {
                Ok(()) => routed.push(self.enrich(point)),
                Err(e) => {
                    incr(&self.stats.points_invalid);
                    tracing::debug!(error = %e, "Rejected point");
                    outcome.rejected += 1;
                    outcome.first_error.get_or_insert(e);
                }
            }
        }

        outcome.accepted = routed.len();
        self.dispatcher.route(routed).await;
        outcome
    }

    pub fn identities(&self) -> &IdentityCache {
        &self.identities
    }
}
