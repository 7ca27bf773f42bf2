use crate::error::Result;
use crate::mute::MuteIndex;
use crate::rule::{ClusterScope, Rule};
use ringwatch_common::backoff::Backoff;
use ringwatch_common::shutdown::ShutdownSignal;
use ringwatch_common::stats::{incr, set, Stats};
use ringwatch_storage::ConfigStore;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Immutable set of rules applying to this cluster.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    pub version: u64,
    pub rules: HashMap<i64, Arc<Rule>>,
    /// Rules that failed to compile, with the reason.
    pub broken: HashMap<i64, String>,
    by_metric: HashMap<String, Vec<Arc<Rule>>>,
}

impl RuleSnapshot {
    pub fn new(version: u64, rules: Vec<Rule>, broken: HashMap<i64, String>) -> Self {
        let mut by_metric: HashMap<String, Vec<Arc<Rule>>> = HashMap::new();
        let mut map = HashMap::new();
        for rule in rules {
            let rule = Arc::new(rule);
            if let Some(metric) = rule.metric() {
                by_metric
                    .entry(metric.to_string())
                    .or_default()
                    .push(rule.clone());
            }
            map.insert(rule.id, rule);
        }
        Self {
            version,
            rules: map,
            broken,
            by_metric,
        }
    }

    /// Push rules listening to `metric`.
    pub fn push_rules(&self, metric: &str) -> &[Arc<Rule>] {
        self.by_metric.get(metric).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Range-query rules.
    pub fn pull_rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.values().filter(|r| !r.is_push())
    }

    pub fn get(&self, id: i64) -> Option<&Arc<Rule>> {
        self.rules.get(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.rules.contains_key(&id)
    }
}

/// Periodically reloaded rule set, published as an atomic snapshot.
pub struct RuleStore {
    store: Arc<dyn ConfigStore>,
    cluster: String,
    stats: Arc<Stats>,
    current: RwLock<Arc<RuleSnapshot>>,
    version_tx: watch::Sender<u64>,
}

impl RuleStore {
    pub fn new(store: Arc<dyn ConfigStore>, cluster: &str, stats: Arc<Stats>) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            store,
            cluster: cluster.to_string(),
            stats,
            current: RwLock::new(Arc::new(RuleSnapshot::default())),
            version_tx,
        }
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Receives the version of every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Reloads enabled rules scoped to this cluster and publishes a new
    /// snapshot. Rules that fail to compile are kept in `broken`.
    pub fn refresh(&self) -> Result<Arc<RuleSnapshot>> {
        let rows = self.store.list_enabled_rules()?;
        let mut rules = Vec::new();
        let mut broken = HashMap::new();
        for row in rows {
            if !ClusterScope::parse(&row.cluster).matches(&self.cluster) {
                continue;
            }
            match Rule::from_row(&row) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    tracing::warn!(rule_id = row.id, error = %e, "Skipping broken alert rule");
                    broken.insert(row.id, e.to_string());
                }
            }
        }
        set(&self.stats.rules_broken, broken.len() as u64);

        let version = self.snapshot().version + 1;
        let snapshot = Arc::new(RuleSnapshot::new(version, rules, broken));
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.clone();
        self.version_tx.send_replace(version);
        tracing::debug!(
            version,
            rules = snapshot.rules.len(),
            broken = snapshot.broken.len(),
            "Rule snapshot published"
        );
        Ok(snapshot)
    }

    /// Refreshes rules and mutes every `interval`. Failures keep the stale
    /// snapshot and retry with backoff.
    pub async fn run(
        self: Arc<Self>,
        mutes: Arc<MuteIndex>,
        interval: Duration,
        mut shutdown: ShutdownSignal,
    ) {
        let mut backoff = Backoff::for_store();
        loop {
            let rules = self.refresh();
            let mutes = mutes.refresh();
            let delay = match (rules, mutes) {
                (Ok(_), Ok(_)) => {
                    backoff.reset();
                    interval
                }
                (rules, mutes) => {
                    incr(&self.stats.store_errors);
                    let delay = backoff.next_delay().min(interval.max(Duration::from_millis(1)));
                    if let Err(e) = rules {
                        tracing::warn!(error = %e, "Rule refresh failed, keeping stale snapshot");
                    }
                    if let Err(e) = mutes {
                        tracing::warn!(error = %e, "Mute refresh failed, keeping stale mutes");
                    }
                    delay
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Rule refresh loop stopped");
    }
}
