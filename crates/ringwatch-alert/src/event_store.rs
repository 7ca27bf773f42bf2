use crate::error::{AlertError, Result};
use crate::rule::event_hash;
use ringwatch_common::backoff::{Backoff, STORE_BACKOFF_BASE, STORE_BACKOFF_CAP};
use ringwatch_common::stats::{incr, set, Stats};
use ringwatch_common::types::{parse_tags, tags_to_string, Severity};
use ringwatch_storage::{ConfigStore, CurEventRow, HisEventRow};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const EVENT_SHARDS: usize = 32;
pub const DEFAULT_DEAD_LETTER_MAX: usize = 10_000;

/// In-flight alert of one `(rule_id, series_hash)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEvent {
    pub hash: String,
    pub rule_id: i64,
    pub series_hash: String,
    pub cluster: String,
    pub severity: Severity,
    pub first_trigger_ts: i64,
    pub last_eval_ts: i64,
    /// Starts at `first_trigger_ts`; moves on each emitted notification.
    pub last_sent_ts: i64,
    pub notify_repeat_next_ts: i64,
    pub notify_count: i64,
    pub tags: HashMap<String, String>,
    pub trigger_value: String,
}

impl ActiveEvent {
    pub fn to_row(&self, owner: &str) -> CurEventRow {
        CurEventRow {
            hash: self.hash.clone(),
            rule_id: self.rule_id,
            series_hash: self.series_hash.clone(),
            owner: owner.to_string(),
            cluster: self.cluster.clone(),
            severity: self.severity.level(),
            first_trigger_ts: self.first_trigger_ts,
            last_eval_ts: self.last_eval_ts,
            last_sent_ts: self.last_sent_ts,
            notify_repeat_next_ts: self.notify_repeat_next_ts,
            notify_count: self.notify_count,
            tags: tags_to_string(&self.tags),
            trigger_value: self.trigger_value.clone(),
        }
    }

    /// Decodes a persisted row, rejecting rows whose hash or severity do not
    /// check out.
    pub fn from_row(row: &CurEventRow) -> Result<Self> {
        let corrupt = |reason: String| AlertError::CorruptEvent {
            hash: row.hash.clone(),
            reason,
        };
        if event_hash(row.rule_id, &row.series_hash) != row.hash {
            return Err(corrupt("hash does not match rule and series".to_string()));
        }
        let severity = Severity::from_level(row.severity)
            .ok_or_else(|| corrupt(format!("invalid severity {}", row.severity)))?;
        Ok(Self {
            hash: row.hash.clone(),
            rule_id: row.rule_id,
            series_hash: row.series_hash.clone(),
            cluster: row.cluster.clone(),
            severity,
            first_trigger_ts: row.first_trigger_ts,
            last_eval_ts: row.last_eval_ts,
            last_sent_ts: row.last_sent_ts,
            notify_repeat_next_ts: row.notify_repeat_next_ts,
            notify_count: row.notify_count,
            tags: parse_tags(&row.tags),
            trigger_value: row.trigger_value.clone(),
        })
    }

    pub fn to_history(&self, recover_ts: i64) -> HisEventRow {
        HisEventRow {
            id: 0,
            hash: self.hash.clone(),
            rule_id: self.rule_id,
            series_hash: self.series_hash.clone(),
            cluster: self.cluster.clone(),
            severity: self.severity.level(),
            first_trigger_ts: self.first_trigger_ts,
            last_eval_ts: self.last_eval_ts,
            last_sent_ts: self.last_sent_ts,
            notify_count: self.notify_count,
            tags: tags_to_string(&self.tags),
            trigger_value: self.trigger_value.clone(),
            recover_ts,
        }
    }
}

/// Result of [`EventStore::fire`].
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Created(ActiveEvent),
    /// A row already existed; only severity and `last_eval_ts` changed.
    Refired(ActiveEvent),
}

/// Retry budget for one store write inside an evaluation.
#[derive(Debug, Clone, Copy)]
pub struct PersistPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: STORE_BACKOFF_BASE,
            cap: STORE_BACKOFF_CAP,
        }
    }
}

#[derive(Debug, Clone)]
enum CurrentWrite {
    Upsert(CurEventRow),
    Delete,
}

/// Writes of one hash not yet in the store. History rows go first, then
/// the latest state of the active row.
#[derive(Debug, Clone, Default)]
struct PendingWrite {
    history: Vec<HisEventRow>,
    current: Option<CurrentWrite>,
}

impl PendingWrite {
    fn upsert(row: CurEventRow) -> Self {
        Self {
            history: Vec::new(),
            current: Some(CurrentWrite::Upsert(row)),
        }
    }

    fn delete(history: Option<HisEventRow>) -> Self {
        Self {
            history: history.into_iter().collect(),
            current: Some(CurrentWrite::Delete),
        }
    }

    /// Folds a newer write on top of an older one.
    fn merge(mut older: PendingWrite, newer: PendingWrite) -> Self {
        older.history.extend(newer.history);
        if newer.current.is_some() {
            older.current = newer.current;
        }
        older
    }

    fn is_empty(&self) -> bool {
        self.history.is_empty() && self.current.is_none()
    }
}

/// Active events, one per hash, mirrored into the configuration store.
///
/// Each hash lives in one of several async-mutex shards; every transition
/// of a hash and its store write happen while holding that shard. Writes
/// that keep failing are parked in a bounded dead-letter map and retried by
/// the sweeper.
pub struct EventStore {
    owner: String,
    store: Arc<dyn ConfigStore>,
    shards: Vec<tokio::sync::Mutex<HashMap<String, ActiveEvent>>>,
    dead: Mutex<HashMap<String, PendingWrite>>,
    dead_letter_max: usize,
    policy: PersistPolicy,
    stats: Arc<Stats>,
}

impl EventStore {
    pub fn new(
        owner: &str,
        store: Arc<dyn ConfigStore>,
        dead_letter_max: usize,
        policy: PersistPolicy,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            store,
            shards: (0..EVENT_SHARDS)
                .map(|_| tokio::sync::Mutex::new(HashMap::new()))
                .collect(),
            dead: Mutex::new(HashMap::new()),
            dead_letter_max,
            policy,
            stats,
        }
    }

    fn shard(&self, hash: &str) -> &tokio::sync::Mutex<HashMap<String, ActiveEvent>> {
        let mut h = DefaultHasher::new();
        hash.hash(&mut h);
        &self.shards[(h.finish() % self.shards.len() as u64) as usize]
    }

    fn lock_dead(&self) -> MutexGuard<'_, HashMap<String, PendingWrite>> {
        self.dead
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, hash: &str, write: &mut PendingWrite) -> ringwatch_storage::error::Result<()> {
        while let Some(his) = write.history.first() {
            self.store.insert_his_event(his)?;
            write.history.remove(0);
        }
        match &write.current {
            Some(CurrentWrite::Upsert(row)) => self.store.upsert_cur_event(row)?,
            Some(CurrentWrite::Delete) => {
                self.store.delete_cur_events(&[hash.to_string()])?;
            }
            None => {}
        }
        write.current = None;
        Ok(())
    }

    /// Writes `write` for `hash`, merged with any parked write of the same
    /// hash. Must be called while holding the hash's shard.
    async fn persist(&self, hash: &str, write: PendingWrite) {
        let parked = self.lock_dead().remove(hash);
        let mut write = match parked {
            Some(older) => PendingWrite::merge(older, write),
            None => write,
        };

        let mut backoff = Backoff::new(self.policy.base, self.policy.cap);
        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            match self.apply(hash, &mut write) {
                Ok(()) => {
                    self.update_dead_gauge();
                    return;
                }
                Err(e) => {
                    incr(&self.stats.store_errors);
                    tracing::warn!(hash, attempt, error = %e, "Event write failed");
                    if attempt < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }
        self.park(hash, write);
    }

    fn park(&self, hash: &str, write: PendingWrite) {
        if write.is_empty() {
            return;
        }
        let mut dead = self.lock_dead();
        if dead.len() >= self.dead_letter_max && !dead.contains_key(hash) {
            tracing::error!(hash, max = self.dead_letter_max, "Dead-letter set full, dropping event write");
            return;
        }
        dead.insert(hash.to_string(), write);
        set(&self.stats.dead_letters, dead.len() as u64);
        tracing::error!(hash, parked = dead.len(), "Event write parked in dead-letter set");
    }

    fn update_dead_gauge(&self) {
        let n = self.lock_dead().len();
        set(&self.stats.dead_letters, n as u64);
    }

    /// Loads the rows owned by this instance into memory. A row that cannot
    /// be decoded aborts the restore.
    pub async fn restore(&self) -> Result<Vec<ActiveEvent>> {
        let rows = self.store.list_cur_events(&self.owner)?;
        let mut restored = Vec::with_capacity(rows.len());
        for row in &rows {
            let event = ActiveEvent::from_row(row)?;
            self.shard(&event.hash)
                .lock()
                .await
                .insert(event.hash.clone(), event.clone());
            restored.push(event);
        }
        tracing::info!(count = restored.len(), owner = %self.owner, "Restored active events");
        Ok(restored)
    }

    /// Inserts a new active event, or on an existing hash refreshes only its
    /// severity and `last_eval_ts`.
    pub async fn fire(&self, event: ActiveEvent) -> FireOutcome {
        let mut shard = self.shard(&event.hash).lock().await;
        let (outcome, row) = match shard.get_mut(&event.hash) {
            Some(existing) => {
                existing.severity = event.severity;
                existing.last_eval_ts = existing.last_eval_ts.max(event.last_eval_ts);
                (
                    FireOutcome::Refired(existing.clone()),
                    existing.to_row(&self.owner),
                )
            }
            None => {
                let row = event.to_row(&self.owner);
                shard.insert(event.hash.clone(), event.clone());
                (FireOutcome::Created(event.clone()), row)
            }
        };
        self.persist(&event.hash, PendingWrite::upsert(row)).await;
        outcome
    }

    /// Records an evaluation of a firing series in memory.
    pub async fn touch(&self, hash: &str, now: i64) {
        if let Some(ev) = self.shard(hash).lock().await.get_mut(hash) {
            ev.last_eval_ts = ev.last_eval_ts.max(now);
        }
    }

    /// Mutates an event under its lock and persists the result.
    pub async fn update<R>(&self, hash: &str, f: impl FnOnce(&mut ActiveEvent) -> R) -> Option<R> {
        let mut shard = self.shard(hash).lock().await;
        let ev = shard.get_mut(hash)?;
        let out = f(ev);
        let row = ev.to_row(&self.owner);
        self.persist(hash, PendingWrite::upsert(row)).await;
        Some(out)
    }

    /// Closes an event: removes the active row and appends history with
    /// `recover_ts = last_eval_ts`.
    pub async fn recover(&self, hash: &str, now: i64) -> Option<ActiveEvent> {
        let mut shard = self.shard(hash).lock().await;
        let mut ev = shard.remove(hash)?;
        ev.last_eval_ts = ev.last_eval_ts.max(now);
        let his = ev.to_history(ev.last_eval_ts);
        self.persist(hash, PendingWrite::delete(Some(his))).await;
        Some(ev)
    }

    /// Removes events for which `pred` returns `true`, without history.
    /// Their rows are deleted from the store when `delete_rows` is set.
    pub async fn drop_where(
        &self,
        pred: impl Fn(&ActiveEvent) -> bool,
        delete_rows: bool,
    ) -> Vec<ActiveEvent> {
        let mut dropped = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().await;
            let hashes: Vec<String> = shard
                .values()
                .filter(|ev| pred(ev))
                .map(|ev| ev.hash.clone())
                .collect();
            for hash in hashes {
                if let Some(ev) = shard.remove(&hash) {
                    if delete_rows {
                        self.persist(&hash, PendingWrite::delete(None)).await;
                    }
                    dropped.push(ev);
                }
            }
        }
        dropped
    }

    /// Hashes whose repeat clock is due at `now`.
    pub async fn due(&self, now: i64) -> Vec<String> {
        let mut due = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().await;
            due.extend(
                shard
                    .values()
                    .filter(|ev| ev.notify_repeat_next_ts <= now)
                    .map(|ev| ev.hash.clone()),
            );
        }
        due
    }

    pub async fn get(&self, hash: &str) -> Option<ActiveEvent> {
        self.shard(hash).lock().await.get(hash).cloned()
    }

    pub async fn all(&self) -> Vec<ActiveEvent> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.lock().await.values().cloned());
        }
        out
    }

    pub async fn len(&self) -> usize {
        let mut n = 0;
        for shard in &self.shards {
            n += shard.lock().await.len();
        }
        n
    }

    /// One attempt at every parked write. Returns how many remain parked.
    pub async fn retry_dead_letters(&self) -> usize {
        let hashes: Vec<String> = self.lock_dead().keys().cloned().collect();
        for hash in hashes {
            let _shard = self.shard(&hash).lock().await;
            let Some(mut write) = self.lock_dead().remove(&hash) else {
                continue;
            };
            match self.apply(&hash, &mut write) {
                Ok(()) => tracing::info!(hash = %hash, "Dead-letter event write succeeded"),
                Err(e) => {
                    tracing::debug!(hash = %hash, error = %e, "Dead-letter retry failed");
                    self.lock_dead().insert(hash, write);
                }
            }
        }
        let remaining = self.dead_letter_count();
        set(&self.stats.dead_letters, remaining as u64);
        remaining
    }

    pub fn dead_letter_count(&self) -> usize {
        self.lock_dead().len()
    }
}
