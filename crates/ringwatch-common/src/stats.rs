use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        /// Process-wide counters shared by every component.
        #[derive(Debug, Default)]
        pub struct Stats {
            $(pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`Stats`].
        #[derive(Debug, Clone, Default, PartialEq, Serialize)]
        pub struct StatsSnapshot {
            $(pub $name: u64,)*
        }

        impl Stats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    points_received,
    points_invalid,
    points_local,
    points_remote,
    queue_dropped,
    batches_sent,
    batches_dropped,
    window_out_of_order,
    rules_broken,
    events_fired,
    events_recovered,
    notify_emitted,
    notify_muted,
    store_errors,
    dead_letters,
    tsdb_errors,
    eval_missed_ticks,
);

/// Adds `n` to a counter.
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

pub fn incr(counter: &AtomicU64) {
    add(counter, 1);
}

/// Overwrites a gauge-like counter.
pub fn set(counter: &AtomicU64, n: u64) {
    counter.store(n, Ordering::Relaxed);
}
