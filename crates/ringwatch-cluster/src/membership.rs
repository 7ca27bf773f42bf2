use crate::error::{ClusterError, Result};
use ringwatch_common::backoff::{Backoff, STORE_BACKOFF_BASE};
use ringwatch_common::shutdown::ShutdownSignal;
use ringwatch_common::stats::{incr, Stats};
use ringwatch_storage::{ConfigStore, HeartbeatRow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub instance_id: String,
    pub cluster: String,
    /// Base URL peers use to reach this instance.
    pub endpoint: String,
    pub heartbeat_interval: Duration,
    pub liveness_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub instance_id: String,
    pub endpoint: String,
}

/// Alive peers of one cluster, sorted by instance id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    peers: Vec<Peer>,
}

impl Roster {
    pub fn new(mut peers: Vec<Peer>) -> Self {
        peers.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        peers.dedup_by(|a, b| a.instance_id == b.instance_id);
        Self { peers }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn ids(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.instance_id.clone()).collect()
    }

    pub fn endpoint(&self, instance_id: &str) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.instance_id == instance_id)
            .map(|p| p.endpoint.as_str())
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.endpoint(instance_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Heartbeats this instance into the store and publishes the live roster.
pub struct Membership {
    config: MembershipConfig,
    store: Arc<dyn ConfigStore>,
    stats: Arc<Stats>,
    roster_tx: watch::Sender<Arc<Roster>>,
}

impl Membership {
    pub fn new(config: MembershipConfig, store: Arc<dyn ConfigStore>, stats: Arc<Stats>) -> Self {
        let (roster_tx, _) = watch::channel(Arc::new(Roster::default()));
        Self {
            config,
            store,
            stats,
            roster_tx,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Roster>> {
        self.roster_tx.subscribe()
    }

    /// Last successfully read roster.
    pub fn roster(&self) -> Arc<Roster> {
        self.roster_tx.borrow().clone()
    }

    /// One heartbeat round at wall time `now`: reads the cluster's rows,
    /// checks that no other live process uses our id, writes our own row and
    /// publishes the alive set when it changed.
    pub fn heartbeat_once(&self, now: i64) -> Result<Arc<Roster>> {
        let ttl = self.config.liveness_ttl.as_secs() as i64;
        let rows = self.store.list_heartbeats(&self.config.cluster)?;

        if let Some(other) = rows.iter().find(|r| {
            r.instance_id == self.config.instance_id
                && r.endpoint != self.config.endpoint
                && now - r.last_heartbeat_ts <= ttl
        }) {
            return Err(ClusterError::DuplicateInstance {
                instance_id: self.config.instance_id.clone(),
                other_endpoint: other.endpoint.clone(),
            });
        }

        self.store.upsert_heartbeat(&HeartbeatRow {
            instance_id: self.config.instance_id.clone(),
            cluster: self.config.cluster.clone(),
            endpoint: self.config.endpoint.clone(),
            last_heartbeat_ts: now,
        })?;

        let mut peers: Vec<Peer> = rows
            .into_iter()
            .filter(|r| r.instance_id != self.config.instance_id)
            .filter(|r| now - r.last_heartbeat_ts <= ttl)
            .map(|r| Peer {
                instance_id: r.instance_id,
                endpoint: r.endpoint,
            })
            .collect();
        peers.push(Peer {
            instance_id: self.config.instance_id.clone(),
            endpoint: self.config.endpoint.clone(),
        });
        let roster = Roster::new(peers);

        let changed = self.roster_tx.send_if_modified(|current| {
            if **current == roster {
                false
            } else {
                *current = Arc::new(roster.clone());
                true
            }
        });
        if changed {
            tracing::info!(
                cluster = %self.config.cluster,
                peers = ?roster.ids(),
                "Roster changed"
            );
        }
        Ok(self.roster())
    }

    /// Heartbeat loop. Transient store errors back off up to four heartbeat
    /// intervals and keep the previous roster; a duplicate instance id ends
    /// the loop with an error.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) -> Result<()> {
        let cap = self.config.heartbeat_interval * 4;
        let mut backoff = Backoff::new(STORE_BACKOFF_BASE, cap);
        loop {
            let delay = match self.heartbeat_once(ringwatch_common::now_secs()) {
                Ok(_) => {
                    backoff.reset();
                    self.config.heartbeat_interval
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Fatal membership error");
                    return Err(e);
                }
                Err(e) => {
                    incr(&self.stats.store_errors);
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Heartbeat failed, keeping previous roster"
                    );
                    delay
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    tracing::info!("Membership loop stopped");
                    return Ok(());
                }
            }
        }
    }
}
