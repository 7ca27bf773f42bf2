use crate::error::{AlertError, Result};
use crate::filter::{compile_all, matches_all, TagFilter, TagFilterSpec};
use crate::rule::ClusterScope;
use ringwatch_storage::{AlertMuteRow, ConfigStore};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Mutes stay around this long after their end before being purged.
pub const MUTE_PURGE_GRACE_SECS: i64 = 30;

/// A compiled mute.
#[derive(Debug, Clone)]
pub struct Mute {
    pub id: i64,
    pub scope: ClusterScope,
    pub begin_ts: i64,
    pub end_ts: i64,
    pub filters: Vec<TagFilter>,
    pub cause: String,
}

impl Mute {
    pub fn from_row(row: &AlertMuteRow) -> Result<Self> {
        if row.end_ts <= row.begin_ts {
            return Err(AlertError::Configuration(format!(
                "mute {} ends before it begins",
                row.id
            )));
        }
        let specs: Vec<TagFilterSpec> = serde_json::from_str(&row.tags)?;
        Ok(Self {
            id: row.id,
            scope: ClusterScope::parse(&row.cluster),
            begin_ts: row.begin_ts,
            end_ts: row.end_ts,
            filters: compile_all(&specs)?,
            cause: row.cause.clone(),
        })
    }

    pub fn matches(&self, cluster: &str, tags: &HashMap<String, String>, now: i64) -> bool {
        now >= self.begin_ts
            && now <= self.end_ts
            && self.scope.matches(cluster)
            && matches_all(&self.filters, tags)
    }

    fn expired(&self, now: i64) -> bool {
        self.end_ts + MUTE_PURGE_GRACE_SECS < now
    }
}

/// Compiled mutes answering "is this event muted now?".
pub struct MuteIndex {
    store: Arc<dyn ConfigStore>,
    mutes: RwLock<Arc<Vec<Mute>>>,
}

impl MuteIndex {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            mutes: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn load(&self) -> Arc<Vec<Mute>> {
        self.mutes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn replace(&self, mutes: Vec<Mute>) {
        *self
            .mutes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(mutes);
    }

    /// Reloads enabled mutes. Mutes that fail to compile are skipped.
    pub fn refresh(&self) -> Result<usize> {
        let rows = self.store.list_mutes()?;
        let mut mutes = Vec::with_capacity(rows.len());
        for row in &rows {
            match Mute::from_row(row) {
                Ok(m) => mutes.push(m),
                Err(e) => tracing::warn!(mute_id = row.id, error = %e, "Skipping invalid mute"),
            }
        }
        let n = mutes.len();
        self.replace(mutes);
        Ok(n)
    }

    /// Id of the first mute covering `(cluster, tags)` at `now`.
    pub fn muted_by(&self, cluster: &str, tags: &HashMap<String, String>, now: i64) -> Option<i64> {
        self.load()
            .iter()
            .find(|m| m.matches(cluster, tags, now))
            .map(|m| m.id)
    }

    pub fn is_muted(&self, cluster: &str, tags: &HashMap<String, String>, now: i64) -> bool {
        self.muted_by(cluster, tags, now).is_some()
    }

    /// Removes mutes that ended more than the grace period ago, from memory
    /// and from the store.
    pub fn purge_expired(&self, now: i64) -> Result<usize> {
        let current = self.load();
        let (expired, live): (Vec<&Mute>, Vec<&Mute>) =
            current.iter().partition(|m| m.expired(now));
        if expired.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = expired.iter().map(|m| m.id).collect();
        self.store.delete_mutes(&ids)?;
        self.replace(live.into_iter().cloned().collect());
        tracing::info!(count = ids.len(), "Purged expired mutes");
        Ok(ids.len())
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
