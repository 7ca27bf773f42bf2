use crate::event_store::EventStore;
use crate::mute::MuteIndex;
use crate::rule_store::RuleStore;
use crate::state::{SeriesState, StateTable};
use crate::window::WindowStore;
use ringwatch_common::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;

/// What one sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub windows_expired: usize,
    pub windows_orphaned: usize,
    pub states_dropped: usize,
    pub events_dropped: usize,
    pub mutes_purged: usize,
    pub dead_letters_left: usize,
}

/// Periodic garbage collection of windows, states, orphaned events and
/// expired mutes, plus dead-letter retries.
pub struct Sweeper {
    rules: Arc<RuleStore>,
    windows: Arc<WindowStore>,
    states: Arc<StateTable>,
    events: Arc<EventStore>,
    mutes: Arc<MuteIndex>,
}

impl Sweeper {
    pub fn new(
        rules: Arc<RuleStore>,
        windows: Arc<WindowStore>,
        states: Arc<StateTable>,
        events: Arc<EventStore>,
        mutes: Arc<MuteIndex>,
    ) -> Self {
        Self {
            rules,
            windows,
            states,
            events,
            mutes,
        }
    }

    pub async fn sweep(&self, now: i64) -> SweepReport {
        let mut report = SweepReport {
            windows_expired: self.windows.gc(now),
            ..SweepReport::default()
        };

        // Version 0 is the empty snapshot before the first load; pruning
        // against it would drop every restored event.
        let snapshot = self.rules.snapshot();
        if snapshot.version > 0 {
            report.windows_orphaned = self.windows.retain_rules(|id| snapshot.contains(id));
            report.states_dropped = self.states.retain(|key, state| {
                let Some(rule) = snapshot.get(key.0) else {
                    return false;
                };
                // Pending push series whose window expired cannot fire anymore.
                !rule.is_push()
                    || matches!(state, SeriesState::Firing { .. })
                    || self.windows.contains(key)
            });
            let dropped = self
                .events
                .drop_where(|ev| !snapshot.contains(ev.rule_id), true)
                .await;
            for ev in &dropped {
                tracing::info!(
                    rule_id = ev.rule_id,
                    hash = %ev.hash,
                    "Dropped active event of removed or disabled rule"
                );
            }
            report.events_dropped = dropped.len();
        }

        report.mutes_purged = match self.mutes.purge_expired(now) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Mute purge failed");
                0
            }
        };
        report.dead_letters_left = self.events.retry_dead_letters().await;
        report
    }

    pub async fn run(self: Arc<Self>, gc_interval: Duration, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(gc_interval.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so rules load first.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep(ringwatch_common::now_secs()).await;
                    if report != SweepReport::default() {
                        tracing::debug!(?report, "Sweep finished");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Sweeper stopped");
    }
}
