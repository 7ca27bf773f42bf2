use ringwatch_common::fingerprint::hash64;
use std::sync::{Arc, RwLock};

pub const DEFAULT_VNODES: usize = 500;

/// Consistent-hash ring mapping 64-bit keys to instance ids.
///
/// Each member is placed at `vnodes` positions derived from
/// `hash64("{id}#{n}")`. A key belongs to the first position at or after it,
/// wrapping around. Equal positions are ordered by id so the
/// lexicographically smaller id wins.
///
/// # Examples
///
/// ```
/// use ringwatch_cluster::ring::HashRing;
///
/// let ring = HashRing::new(&["p1".to_string()], 16);
/// assert_eq!(ring.get(42), Some("p1"));
/// assert!(HashRing::new(&[], 16).get(42).is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: Vec<(u64, String)>,
    members: Vec<String>,
}

impl HashRing {
    pub fn new(members: &[String], vnodes: usize) -> Self {
        let mut members = members.to_vec();
        members.sort();
        members.dedup();

        let vnodes = vnodes.max(1);
        let mut points = Vec::with_capacity(members.len() * vnodes);
        for id in &members {
            for n in 0..vnodes {
                points.push((hash64(format!("{id}#{n}").as_bytes()), id.clone()));
            }
        }
        points.sort();
        Self { points, members }
    }

    /// Owner of `key`, or `None` for an empty ring.
    pub fn get(&self, key: u64) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|(pos, _)| *pos < key);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(self.points[idx].1.as_str())
    }

    /// Sorted member ids.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Shared, atomically swapped ring.
///
/// Readers clone the current `Arc` and keep using it for the rest of their
/// lookup while a rebuild publishes a new one.
#[derive(Debug)]
pub struct RingHandle {
    vnodes: usize,
    current: RwLock<Arc<HashRing>>,
}

impl RingHandle {
    pub fn new(vnodes: usize) -> Self {
        Self {
            vnodes,
            current: RwLock::new(Arc::new(HashRing::default())),
        }
    }

    pub fn load(&self) -> Arc<HashRing> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Rebuilds the ring from `members` and swaps it in. Returns `false` when
    /// the member set is unchanged and no swap happened.
    pub fn rebuild(&self, members: &[String]) -> bool {
        let mut sorted = members.to_vec();
        sorted.sort();
        sorted.dedup();
        if self.load().members() == sorted.as_slice() {
            return false;
        }
        let ring = Arc::new(HashRing::new(&sorted, self.vnodes));
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = ring;
        true
    }

    /// Whether `key` belongs to `instance_id`. An empty ring owns nothing
    /// remotely, so every key is treated as local.
    pub fn is_owner(&self, key: u64, instance_id: &str) -> bool {
        match self.load().get(key) {
            Some(owner) => owner == instance_id,
            None => true,
        }
    }
}

/// Ring key of a rule id, used to spread pull-evaluated rules over peers.
pub fn rule_key(rule_id: i64) -> u64 {
    hash64(rule_id.to_string().as_bytes())
}
