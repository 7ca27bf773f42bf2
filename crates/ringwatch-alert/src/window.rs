use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// `(rule_id, series_hash)`
pub type WindowKey = (i64, String);

pub const DEFAULT_SHARDS: usize = 32;
pub const DEFAULT_MAX_POINTS: usize = 4096;

#[derive(Debug)]
struct SeriesWindow {
    retain_secs: i64,
    samples: VecDeque<(i64, f64)>,
}

impl SeriesWindow {
    fn latest(&self) -> Option<i64> {
        self.samples.back().map(|(ts, _)| *ts)
    }

    fn evict(&mut self, max_points: usize) {
        if let Some(latest) = self.latest() {
            let cutoff = latest - self.retain_secs;
            while self.samples.front().is_some_and(|(ts, _)| *ts < cutoff) {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > max_points {
            self.samples.pop_front();
        }
    }
}

/// Sharded store of per-series sliding windows.
///
/// Each shard is guarded by its own read/write lock. Windows keep samples in
/// strictly increasing timestamp order; anything at or before the latest
/// timestamp is rejected.
pub struct WindowStore {
    shards: Vec<RwLock<HashMap<WindowKey, SeriesWindow>>>,
    max_points: usize,
}

impl WindowStore {
    pub fn new(shards: usize, max_points: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            max_points: max_points.max(1),
        }
    }

    fn shard_of(&self, key: &WindowKey) -> usize {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        (h.finish() % self.shards.len() as u64) as usize
    }

    fn read_shard(&self, idx: usize) -> RwLockReadGuard<'_, HashMap<WindowKey, SeriesWindow>> {
        self.shards[idx]
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_shard(&self, idx: usize) -> RwLockWriteGuard<'_, HashMap<WindowKey, SeriesWindow>> {
        self.shards[idx]
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a sample, evicting what falls out of `retain_secs`. Returns
    /// `false` when `ts` is not newer than the window's latest sample.
    pub fn insert(&self, key: &WindowKey, ts: i64, value: f64, retain_secs: i64) -> bool {
        let mut shard = self.write_shard(self.shard_of(key));
        let window = shard.entry(key.clone()).or_insert_with(|| SeriesWindow {
            retain_secs,
            samples: VecDeque::new(),
        });
        if window.latest().is_some_and(|latest| ts <= latest) {
            return false;
        }
        window.retain_secs = retain_secs;
        window.samples.push_back((ts, value));
        window.evict(self.max_points);
        true
    }

    /// Copy of the samples with `ts >= since`, oldest first.
    pub fn snapshot(&self, key: &WindowKey, since: i64) -> Vec<(i64, f64)> {
        let shard = self.read_shard(self.shard_of(key));
        shard
            .get(key)
            .map(|w| {
                w.samples
                    .iter()
                    .filter(|(ts, _)| *ts >= since)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn latest(&self, key: &WindowKey) -> Option<i64> {
        self.read_shard(self.shard_of(key))
            .get(key)
            .and_then(SeriesWindow::latest)
    }

    /// Drops windows whose latest sample is older than their retention at
    /// wall time `now`. Returns the number removed.
    pub fn gc(&self, now: i64) -> usize {
        let mut removed = 0;
        for idx in 0..self.shards.len() {
            let mut shard = self.write_shard(idx);
            let before = shard.len();
            shard.retain(|_, w| {
                w.latest()
                    .is_some_and(|latest| latest >= now - w.retain_secs)
            });
            removed += before - shard.len();
        }
        removed
    }

    /// Drops every window of a rule for which `keep` returns `false`.
    pub fn retain_rules(&self, keep: impl Fn(i64) -> bool) -> usize {
        let mut removed = 0;
        for idx in 0..self.shards.len() {
            let mut shard = self.write_shard(idx);
            let before = shard.len();
            shard.retain(|(rule_id, _), _| keep(*rule_id));
            removed += before - shard.len();
        }
        removed
    }

    pub fn contains(&self, key: &WindowKey) -> bool {
        self.read_shard(self.shard_of(key)).contains_key(key)
    }

    pub fn len(&self) -> usize {
        (0..self.shards.len()).map(|i| self.read_shard(i).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WindowStore {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS, DEFAULT_MAX_POINTS)
    }
}
