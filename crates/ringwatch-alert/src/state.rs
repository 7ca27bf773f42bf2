use crate::window::WindowKey;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

/// Alert state of one `(rule_id, series_hash)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesState {
    Idle,
    Pending { since: i64 },
    /// `clear_since` is set while a non-breach is waiting out the recovery
    /// duration.
    Firing { clear_since: Option<i64> },
}

/// What a single step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changed (idle and no breach, or still pending).
    Unchanged,
    /// First breach; waiting for `for_duration`.
    Pending,
    /// A pending breach cleared before firing.
    Cleared,
    Fired { first_trigger_ts: i64 },
    /// Already firing and still breaching.
    StillFiring,
    /// Firing, breach cleared, recovery not yet sustained.
    Recovering,
    Recovered,
    /// Outside the enable window; state untouched.
    Suppressed,
}

/// Durations that drive [`step`].
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub for_duration: i64,
    pub recovery_duration: i64,
}

/// Advances `state` by one evaluation at time `now`.
///
/// # Examples
///
/// ```
/// use ringwatch_alert::state::{step, SeriesState, Timing, Transition};
///
/// let t = Timing { for_duration: 60, recovery_duration: 0 };
/// let mut s = SeriesState::Idle;
/// assert_eq!(step(&mut s, true, 100, t, true), Transition::Pending);
/// assert_eq!(step(&mut s, true, 160, t, true), Transition::Fired { first_trigger_ts: 100 });
/// assert_eq!(step(&mut s, false, 170, t, true), Transition::Recovered);
/// ```
pub fn step(state: &mut SeriesState, breach: bool, now: i64, t: Timing, enabled: bool) -> Transition {
    if !enabled {
        return Transition::Suppressed;
    }
    match *state {
        SeriesState::Idle if breach => {
            if t.for_duration <= 0 {
                *state = SeriesState::Firing { clear_since: None };
                Transition::Fired {
                    first_trigger_ts: now,
                }
            } else {
                *state = SeriesState::Pending { since: now };
                Transition::Pending
            }
        }
        SeriesState::Idle => Transition::Unchanged,
        SeriesState::Pending { since } if breach => {
            if now.saturating_sub(since) >= t.for_duration {
                *state = SeriesState::Firing { clear_since: None };
                Transition::Fired {
                    first_trigger_ts: since,
                }
            } else {
                Transition::Unchanged
            }
        }
        SeriesState::Pending { .. } => {
            *state = SeriesState::Idle;
            Transition::Cleared
        }
        SeriesState::Firing { .. } if breach => {
            *state = SeriesState::Firing { clear_since: None };
            Transition::StillFiring
        }
        SeriesState::Firing { clear_since } => {
            let since = clear_since.unwrap_or(now);
            if t.recovery_duration <= 0 || now.saturating_sub(since) >= t.recovery_duration {
                *state = SeriesState::Idle;
                Transition::Recovered
            } else {
                *state = SeriesState::Firing {
                    clear_since: Some(since),
                };
                Transition::Recovering
            }
        }
    }
}

const STATE_SHARDS: usize = 32;

/// Sharded map of series states. Idle series are not stored.
pub struct StateTable {
    shards: Vec<Mutex<HashMap<WindowKey, SeriesState>>>,
}

impl StateTable {
    pub fn new() -> Self {
        Self {
            shards: (0..STATE_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &WindowKey) -> MutexGuard<'_, HashMap<WindowKey, SeriesState>> {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        let idx = (h.finish() % self.shards.len() as u64) as usize;
        self.shards[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn step(&self, key: &WindowKey, breach: bool, now: i64, t: Timing, enabled: bool) -> Transition {
        let mut shard = self.shard(key);
        let mut state = shard.get(key).copied().unwrap_or(SeriesState::Idle);
        let transition = step(&mut state, breach, now, t, enabled);
        if state == SeriesState::Idle {
            shard.remove(key);
        } else {
            shard.insert(key.clone(), state);
        }
        transition
    }

    pub fn get(&self, key: &WindowKey) -> SeriesState {
        self.shard(key).get(key).copied().unwrap_or(SeriesState::Idle)
    }

    /// Marks a series as firing, used when active events are restored.
    pub fn set_firing(&self, key: &WindowKey) {
        self.shard(key)
            .insert(key.clone(), SeriesState::Firing { clear_since: None });
    }

    /// Series of `rule_id` that are pending or firing.
    pub fn active_series(&self, rule_id: i64) -> Vec<String> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            out.extend(
                shard
                    .iter()
                    .filter(|((id, _), _)| *id == rule_id)
                    .map(|((_, series), _)| series.clone()),
            );
        }
        out
    }

    /// Drops states for which `keep` returns `false`.
    pub fn retain(&self, keep: impl Fn(&WindowKey, &SeriesState) -> bool) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = shard.len();
            shard.retain(|k, s| keep(k, s));
            removed += before - shard.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StateTable {
    fn default() -> Self {
        Self::new()
    }
}
