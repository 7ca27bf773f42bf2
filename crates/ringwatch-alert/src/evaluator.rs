use crate::error::{AlertError, Result};
use crate::event_store::{ActiveEvent, EventStore, FireOutcome};
use crate::notify::NotifyScheduler;
use crate::predicate::Verdict;
use crate::rule::{event_hash, Rule, RuleKind};
use crate::rule_store::RuleStore;
use crate::state::{StateTable, Timing, Transition};
use crate::tsdb::{QuerySeries, TsdbClient};
use crate::window::WindowStore;
use async_trait::async_trait;
use ringwatch_cluster::{rule_key, PointSink, RingHandle};
use ringwatch_common::shutdown::ShutdownSignal;
use ringwatch_common::stats::{incr, Stats};
use ringwatch_common::types::{readable_value, MetricPoint};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Everything the evaluator shares with the other alert components.
pub struct EvaluatorParts {
    pub instance_id: String,
    pub cluster: String,
    pub rules: Arc<RuleStore>,
    pub windows: Arc<WindowStore>,
    pub states: Arc<StateTable>,
    pub events: Arc<EventStore>,
    pub notifier: Arc<NotifyScheduler>,
    pub ring: Arc<RingHandle>,
    pub tsdb: Option<Arc<dyn TsdbClient>>,
    pub stats: Arc<Stats>,
}

struct PullTask {
    update_at: i64,
    handle: JoinHandle<()>,
}

/// Drives the per-series state machine.
///
/// Threshold rules are evaluated as points arrive through [`PointSink`];
/// range-query rules run on their own timer on the peer that owns the rule
/// on the hash ring.
pub struct Evaluator {
    instance_id: String,
    cluster: String,
    rules: Arc<RuleStore>,
    windows: Arc<WindowStore>,
    states: Arc<StateTable>,
    events: Arc<EventStore>,
    notifier: Arc<NotifyScheduler>,
    ring: Arc<RingHandle>,
    tsdb: Option<Arc<dyn TsdbClient>>,
    stats: Arc<Stats>,
    pull_tasks: Mutex<HashMap<i64, PullTask>>,
}

impl Evaluator {
    pub fn new(parts: EvaluatorParts) -> Self {
        Self {
            instance_id: parts.instance_id,
            cluster: parts.cluster,
            rules: parts.rules,
            windows: parts.windows,
            states: parts.states,
            events: parts.events,
            notifier: parts.notifier,
            ring: parts.ring,
            tsdb: parts.tsdb,
            stats: parts.stats,
            pull_tasks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<i64, PullTask>> {
        self.pull_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reloads this instance's active events and marks their series firing.
    pub async fn restore(&self) -> Result<usize> {
        let restored = self.events.restore().await?;
        for ev in &restored {
            self.states.set_firing(&(ev.rule_id, ev.series_hash.clone()));
        }
        Ok(restored.len())
    }

    /// Feeds one point to every threshold rule listening to its metric.
    pub async fn ingest_point(&self, point: &MetricPoint) {
        let snapshot = self.rules.snapshot();
        for rule in snapshot.push_rules(&point.metric) {
            if !rule.accepts(point) {
                continue;
            }
            let series_hash = rule.series_hash_of_point(point);
            let key = (rule.id, series_hash.clone());
            if !self
                .windows
                .insert(&key, point.timestamp, point.value, rule.retention())
            {
                incr(&self.stats.window_out_of_order);
                tracing::debug!(
                    rule_id = rule.id,
                    metric = %point.metric,
                    ts = point.timestamp,
                    "Discarding out-of-order sample"
                );
                continue;
            }
            let samples = self
                .windows
                .snapshot(&key, point.timestamp.saturating_sub(rule.for_duration));
            let Some(verdict) = rule.predicate.evaluate(&samples, rule.for_duration) else {
                continue;
            };
            self.advance(
                rule,
                &series_hash,
                &point.tags,
                &point.ident,
                verdict.breach,
                verdict.value,
                point.timestamp,
            )
            .await;
        }
    }

    /// Steps the state machine of one series and applies the resulting
    /// event and notification side effects.
    #[allow(clippy::too_many_arguments)]
    async fn advance(
        &self,
        rule: &Rule,
        series_hash: &str,
        series_tags: &HashMap<String, String>,
        ident: &str,
        breach: bool,
        value: f64,
        now: i64,
    ) -> Transition {
        let key = (rule.id, series_hash.to_string());
        let timing = Timing {
            for_duration: rule.for_duration,
            recovery_duration: rule.recovery_duration,
        };
        let transition = self
            .states
            .step(&key, breach, now, timing, rule.enable.is_active(now));
        let hash = event_hash(rule.id, series_hash);

        match transition {
            Transition::Fired { first_trigger_ts } => {
                let event = ActiveEvent {
                    hash: hash.clone(),
                    rule_id: rule.id,
                    series_hash: series_hash.to_string(),
                    cluster: self.cluster.clone(),
                    severity: rule.severity,
                    first_trigger_ts,
                    last_eval_ts: now,
                    last_sent_ts: first_trigger_ts,
                    notify_repeat_next_ts: now,
                    notify_count: 0,
                    tags: rule.event_tags(series_tags, ident),
                    trigger_value: readable_value(value),
                };
                match self.events.fire(event).await {
                    FireOutcome::Created(_) => {
                        incr(&self.stats.events_fired);
                        tracing::info!(
                            rule_id = rule.id,
                            rule = %rule.name,
                            hash = %hash,
                            first_trigger_ts,
                            "Alert firing"
                        );
                        self.notifier.notify(rule, &hash, now).await;
                    }
                    FireOutcome::Refired(_) => {
                        tracing::debug!(rule_id = rule.id, hash = %hash, "Alert already active");
                    }
                }
            }
            Transition::StillFiring | Transition::Recovering => {
                self.events.touch(&hash, now).await;
            }
            Transition::Recovered => {
                if let Some(ev) = self.events.recover(&hash, now).await {
                    incr(&self.stats.events_recovered);
                    tracing::info!(
                        rule_id = rule.id,
                        rule = %rule.name,
                        hash = %hash,
                        recover_ts = ev.last_eval_ts,
                        "Alert recovered"
                    );
                    self.notifier.notify_recovery(rule, &ev, now).await;
                }
            }
            Transition::Unchanged
            | Transition::Pending
            | Transition::Cleared
            | Transition::Suppressed => {}
        }
        transition
    }

    /// Runs one evaluation of a range-query rule. Series that are pending
    /// or firing but missing from the result count as non-breaching.
    pub async fn eval_pull_once(&self, rule: &Rule, now: i64) -> Result<usize> {
        let RuleKind::RangeQuery {
            expr,
            lookback_secs,
        } = &rule.kind
        else {
            return Ok(0);
        };
        let tsdb = self
            .tsdb
            .as_ref()
            .ok_or_else(|| AlertError::Tsdb("no TSDB client configured".to_string()))?;
        let result = tsdb.range_query(expr, now, *lookback_secs).await?;

        // One verdict per series hash; a breaching member wins its group.
        let mut grouped: HashMap<String, (Verdict, &QuerySeries)> = HashMap::new();
        for series in &result {
            let Some(verdict) = rule.predicate.evaluate(&series.samples, rule.for_duration) else {
                continue;
            };
            match grouped.entry(rule.series_hash_of_labels(&series.labels)) {
                Entry::Occupied(mut slot) => {
                    if verdict.breach && !slot.get().0.breach {
                        slot.insert((verdict, series));
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert((verdict, series));
                }
            }
        }

        let mut seen = HashSet::new();
        for (series_hash, (verdict, series)) in grouped {
            let ident = series.labels.get("ident").map(String::as_str).unwrap_or("");
            self.advance(
                rule,
                &series_hash,
                &series.labels,
                ident,
                verdict.breach,
                verdict.value,
                now,
            )
            .await;
            seen.insert(series_hash);
        }

        let empty = HashMap::new();
        for series_hash in self.states.active_series(rule.id) {
            if !seen.contains(&series_hash) {
                self.advance(rule, &series_hash, &empty, "", false, 0.0, now)
                    .await;
            }
        }
        Ok(result.len())
    }

    fn owns_rule(&self, rule_id: i64) -> bool {
        self.ring.is_owner(rule_key(rule_id), &self.instance_id)
    }

    /// Forgets a rule that moved to another peer. Its rows stay in the
    /// store for the new owner.
    async fn release_rule(&self, rule_id: i64) {
        let states = self.states.retain(|key, _| key.0 != rule_id);
        let events = self.events.drop_where(|ev| ev.rule_id == rule_id, false).await;
        tracing::info!(
            rule_id,
            states,
            events = events.len(),
            "Range-query rule moved to another peer"
        );
    }

    async fn run_pull(self: Arc<Self>, rule: Arc<Rule>, mut shutdown: ShutdownSignal) {
        let period = Duration::from_secs(rule.eval_interval.max(1) as u64);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut owned = false;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => break,
            }
            if !self.owns_rule(rule.id) {
                if owned {
                    self.release_rule(rule.id).await;
                    owned = false;
                }
                continue;
            }
            owned = true;

            let started = Instant::now();
            if let Err(e) = self.eval_pull_once(&rule, ringwatch_common::now_secs()).await {
                incr(&self.stats.tsdb_errors);
                tracing::warn!(rule_id = rule.id, error = %e, "Range query evaluation failed");
            }
            let elapsed = started.elapsed();
            if elapsed > period {
                incr(&self.stats.eval_missed_ticks);
                tracing::warn!(
                    rule_id = rule.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Range query evaluation missed its tick"
                );
            }
        }
    }

    /// Starts a timer task for every new or changed range-query rule and
    /// stops the tasks of rules that left the snapshot.
    pub fn reconcile_pull(self: &Arc<Self>, shutdown: &ShutdownSignal) {
        let snapshot = self.rules.snapshot();
        let mut tasks = self.lock_tasks();
        tasks.retain(|id, task| {
            let keep = snapshot
                .get(*id)
                .is_some_and(|r| !r.is_push() && r.update_at == task.update_at);
            if !keep {
                task.handle.abort();
                tracing::debug!(rule_id = *id, "Stopped range-query task");
            }
            keep
        });
        for rule in snapshot.pull_rules() {
            if tasks.contains_key(&rule.id) {
                continue;
            }
            let handle = tokio::spawn(self.clone().run_pull(rule.clone(), shutdown.clone()));
            tasks.insert(
                rule.id,
                PullTask {
                    update_at: rule.update_at,
                    handle,
                },
            );
            tracing::debug!(rule_id = rule.id, "Started range-query task");
        }
    }

    /// Range-query rules with a running timer task.
    pub fn pull_task_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock_tasks().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Keeps range-query tasks in line with every published rule snapshot.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut versions = self.rules.subscribe();
        loop {
            self.reconcile_pull(&shutdown);
            tokio::select! {
                changed = versions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        for (_, task) in self.lock_tasks().drain() {
            task.handle.abort();
        }
        tracing::info!("Evaluator stopped");
    }
}

#[async_trait]
impl PointSink for Evaluator {
    async fn deliver(&self, points: Vec<MetricPoint>) {
        for point in &points {
            self.ingest_point(point).await;
        }
    }
}
