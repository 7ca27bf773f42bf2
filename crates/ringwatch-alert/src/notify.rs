use crate::event_store::{ActiveEvent, EventStore};
use crate::mute::MuteIndex;
use crate::rule::Rule;
use crate::rule_store::RuleStore;
use ringwatch_common::shutdown::ShutdownSignal;
use ringwatch_common::stats::{incr, Stats};
use ringwatch_common::types::Severity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_NOTIFY_BUFFER: usize = 10_000;

/// Request handed to the external notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub rule_id: i64,
    pub rule_name: String,
    pub event_hash: String,
    pub cluster: String,
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub severity: Severity,
    pub tags: HashMap<String, String>,
    pub trigger_value: String,
    pub first_trigger_ts: i64,
    /// Notifications sent for this event, including this one.
    pub notify_count: i64,
    pub is_recovery: bool,
    pub ts: i64,
}

impl NotifyRequest {
    fn new(rule: &Rule, ev: &ActiveEvent, is_recovery: bool, now: i64) -> Self {
        Self {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            event_hash: ev.hash.clone(),
            cluster: ev.cluster.clone(),
            channels: rule.notify_channels.clone(),
            groups: rule.notify_groups.clone(),
            severity: ev.severity,
            tags: ev.tags.clone(),
            trigger_value: ev.trigger_value.clone(),
            first_trigger_ts: ev.first_trigger_ts,
            notify_count: ev.notify_count,
            is_recovery,
            ts: now,
        }
    }
}

/// What happened to a due event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    /// Muted; retried after one scan interval.
    Muted,
    /// `notify_max_number` reached; the repeat clock is parked.
    Exhausted,
    /// The event or its rule is gone.
    Missing,
}

/// Drives the repeat clock of active events and emits notification
/// requests onto a bounded channel.
pub struct NotifyScheduler {
    cluster: String,
    events: Arc<EventStore>,
    rules: Arc<RuleStore>,
    mutes: Arc<MuteIndex>,
    tx: mpsc::Sender<NotifyRequest>,
    scan_interval: Duration,
    stats: Arc<Stats>,
}

impl NotifyScheduler {
    pub fn new(
        cluster: &str,
        events: Arc<EventStore>,
        rules: Arc<RuleStore>,
        mutes: Arc<MuteIndex>,
        tx: mpsc::Sender<NotifyRequest>,
        scan_interval: Duration,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            cluster: cluster.to_string(),
            events,
            rules,
            mutes,
            tx,
            scan_interval,
            stats,
        }
    }

    fn scan_secs(&self) -> i64 {
        (self.scan_interval.as_secs() as i64).max(1)
    }

    /// Notifies `hash` now if it is not muted and under its cap, then moves
    /// its repeat clock.
    pub async fn notify(&self, rule: &Rule, hash: &str, now: i64) -> NotifyOutcome {
        let scan = self.scan_secs();
        let outcome = self
            .events
            .update(hash, |ev| {
                if self.mutes.is_muted(&self.cluster, &ev.tags, now) {
                    ev.notify_repeat_next_ts = now + scan;
                    return (NotifyOutcome::Muted, None);
                }
                if rule.notify_max_number > 0 && ev.notify_count >= rule.notify_max_number {
                    ev.notify_repeat_next_ts = i64::MAX;
                    return (NotifyOutcome::Exhausted, None);
                }
                ev.last_sent_ts = now;
                ev.notify_count += 1;
                ev.notify_repeat_next_ts = if rule.notify_repeat_step > 0 {
                    now + rule.notify_repeat_step
                } else {
                    i64::MAX
                };
                let req = NotifyRequest::new(rule, ev, false, now);
                (NotifyOutcome::Sent, Some(req))
            })
            .await;

        match outcome {
            Some((NotifyOutcome::Sent, Some(req))) => {
                self.emit(req).await;
                NotifyOutcome::Sent
            }
            Some((NotifyOutcome::Muted, _)) => {
                incr(&self.stats.notify_muted);
                tracing::debug!(rule_id = rule.id, hash, "Notification muted");
                NotifyOutcome::Muted
            }
            Some((outcome, _)) => outcome,
            None => NotifyOutcome::Missing,
        }
    }

    /// Emits the recovery notification of a closed event when the rule asks
    /// for one and the event is not muted.
    pub async fn notify_recovery(&self, rule: &Rule, ev: &ActiveEvent, now: i64) -> NotifyOutcome {
        if !rule.notify_on_recover {
            return NotifyOutcome::Missing;
        }
        if self.mutes.is_muted(&self.cluster, &ev.tags, now) {
            incr(&self.stats.notify_muted);
            return NotifyOutcome::Muted;
        }
        self.emit(NotifyRequest::new(rule, ev, true, now)).await;
        NotifyOutcome::Sent
    }

    async fn emit(&self, req: NotifyRequest) {
        let (rule_id, hash) = (req.rule_id, req.event_hash.clone());
        if self.tx.send(req).await.is_err() {
            tracing::warn!(rule_id, hash = %hash, "Notifier channel closed, request dropped");
            return;
        }
        incr(&self.stats.notify_emitted);
    }

    /// Emits every event whose repeat clock is due. Returns how many
    /// requests were sent.
    pub async fn tick(&self, now: i64) -> usize {
        let snapshot = self.rules.snapshot();
        let mut sent = 0;
        for hash in self.events.due(now).await {
            let Some(ev) = self.events.get(&hash).await else {
                continue;
            };
            // Events of removed rules are dropped by the sweeper.
            let Some(rule) = snapshot.get(ev.rule_id) else {
                continue;
            };
            if self.notify(rule, &hash, now).await == NotifyOutcome::Sent {
                sent += 1;
            }
        }
        sent
    }

    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.scan_interval.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let sent = self.tick(ringwatch_common::now_secs()).await;
                    if sent > 0 {
                        tracing::debug!(sent, "Repeat notifications emitted");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Notify scheduler stopped");
    }
}
