use crate::membership::Roster;
use crate::queue::DispatchQueue;
use crate::ring::RingHandle;
use crate::{BatchSender, PointSink};
use ringwatch_common::shutdown::ShutdownSignal;
use ringwatch_common::stats::{add, incr, Stats};
use ringwatch_common::types::MetricPoint;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub queue_max: usize,
    pub read_batch: usize,
    /// Attempts per batch before it is dropped.
    pub send_retries: u32,
    pub send_retry_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_max: 1_000_000,
            read_batch: 2_000,
            send_retries: 15,
            send_retry_interval: Duration::from_secs(1),
        }
    }
}

struct Writer {
    queue: Arc<DispatchQueue>,
    handle: JoinHandle<()>,
}

/// Routes points to their ring owner.
///
/// Points owned by this instance go straight to the local [`PointSink`];
/// everything else is queued per remote peer and shipped by one writer task
/// per queue.
pub struct Dispatcher {
    self_id: String,
    config: DispatchConfig,
    ring: Arc<RingHandle>,
    sender: Arc<dyn BatchSender>,
    local: Arc<dyn PointSink>,
    stats: Arc<Stats>,
    shutdown: ShutdownSignal,
    writers: Mutex<HashMap<String, Writer>>,
}

impl Dispatcher {
    pub fn new(
        self_id: &str,
        config: DispatchConfig,
        ring: Arc<RingHandle>,
        sender: Arc<dyn BatchSender>,
        local: Arc<dyn PointSink>,
        stats: Arc<Stats>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            self_id: self_id.to_string(),
            config,
            ring,
            sender,
            local,
            stats,
            shutdown,
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn lock_writers(&self) -> MutexGuard<'_, HashMap<String, Writer>> {
        self.writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ring(&self) -> &Arc<RingHandle> {
        &self.ring
    }

    /// Routes a batch of enriched points. Never fails: overflow sheds the
    /// oldest queued point of the affected peer.
    pub async fn route(&self, points: Vec<MetricPoint>) {
        if points.is_empty() {
            return;
        }
        let ring = self.ring.load();
        let mut local = Vec::new();
        let mut remote: HashMap<String, Vec<MetricPoint>> = HashMap::new();
        for point in points {
            match ring.get(point.fingerprint.ring_key()) {
                Some(owner) if owner != self.self_id => {
                    remote.entry(owner.to_string()).or_default().push(point);
                }
                _ => local.push(point),
            }
        }

        for (peer, points) in remote {
            let queue = self.queue_for(&peer);
            add(&self.stats.points_remote, points.len() as u64);
            for point in points {
                if queue.push(point) {
                    incr(&self.stats.queue_dropped);
                }
            }
        }

        if !local.is_empty() {
            add(&self.stats.points_local, local.len() as u64);
            self.local.deliver(local).await;
        }
    }

    fn queue_for(&self, peer: &str) -> Arc<DispatchQueue> {
        let mut writers = self.lock_writers();
        if let Some(w) = writers.get(peer) {
            return w.queue.clone();
        }
        let queue = Arc::new(DispatchQueue::new(peer, self.config.queue_max));
        let handle = tokio::spawn(run_writer(
            queue.clone(),
            self.sender.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.shutdown.clone(),
        ));
        tracing::debug!(peer, "Started dispatch writer");
        writers.insert(
            peer.to_string(),
            Writer {
                queue: queue.clone(),
                handle,
            },
        );
        queue
    }

    /// Peers that currently have a queue.
    pub fn queued_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.lock_writers().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Pending points for `peer`, if it has a queue.
    pub fn queue_len(&self, peer: &str) -> Option<usize> {
        self.lock_writers().get(peer).map(|w| w.queue.len())
    }

    /// Rebuilds the ring for `roster` and tears down queues of departed
    /// peers. Points still queued for them are routed again over the new
    /// ring.
    pub async fn apply_roster(&self, roster: &Roster) {
        let ids = roster.ids();
        if self.ring.rebuild(&ids) {
            tracing::info!(members = ids.len(), "Hash ring rebuilt");
        }

        let removed: Vec<(String, Writer)> = {
            let mut writers = self.lock_writers();
            let gone: Vec<String> = writers
                .keys()
                .filter(|peer| !roster.contains(peer))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|peer| writers.remove(&peer).map(|w| (peer, w)))
                .collect()
        };

        for (peer, writer) in removed {
            writer.queue.close();
            let leftover = writer.queue.drain_all();
            self.sender.forget(&peer);
            tracing::info!(peer = %peer, rerouted = leftover.len(), "Peer left, queue drained");
            // The stale writer only exits after its in-flight batch, which
            // would otherwise keep retrying against a dead peer.
            writer.handle.abort();
            self.route(leftover).await;
        }
    }

    /// Applies every roster published on `roster_rx` until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut roster_rx: watch::Receiver<Arc<Roster>>,
        mut shutdown: ShutdownSignal,
    ) {
        loop {
            let roster = roster_rx.borrow_and_update().clone();
            self.apply_roster(&roster).await;
            tokio::select! {
                changed = roster_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Dispatcher roster loop stopped");
    }

    /// Waits for every writer to finish its final flush.
    pub async fn join_writers(&self) {
        let writers: Vec<Writer> = self.lock_writers().drain().map(|(_, w)| w).collect();
        for writer in writers {
            writer.queue.close();
            let _ = writer.handle.await;
        }
    }
}

async fn run_writer(
    queue: Arc<DispatchQueue>,
    sender: Arc<dyn BatchSender>,
    config: DispatchConfig,
    stats: Arc<Stats>,
    mut shutdown: ShutdownSignal,
) {
    let read_batch = config.read_batch.max(1);
    loop {
        let batch = queue.pop_batch(read_batch);
        if batch.is_empty() {
            if queue.is_closed() || shutdown.is_shutdown() {
                break;
            }
            tokio::select! {
                _ = queue.ready() => {}
                _ = shutdown.recv() => {}
            }
            continue;
        }

        if shutdown.is_shutdown() {
            // Final flush: one attempt per batch.
            match sender.send(queue.peer(), &batch).await {
                Ok(()) => incr(&stats.batches_sent),
                Err(e) => {
                    incr(&stats.batches_dropped);
                    tracing::warn!(peer = queue.peer(), error = %e, size = batch.len(), "Dropped batch during shutdown flush");
                }
            }
            continue;
        }

        send_with_retry(&queue, sender.as_ref(), &config, &stats, &batch, &mut shutdown).await;
    }
    tracing::debug!(peer = queue.peer(), "Dispatch writer stopped");
}

async fn send_with_retry(
    queue: &DispatchQueue,
    sender: &dyn BatchSender,
    config: &DispatchConfig,
    stats: &Stats,
    batch: &[MetricPoint],
    shutdown: &mut ShutdownSignal,
) {
    let attempts = config.send_retries.max(1);
    for attempt in 1..=attempts {
        match sender.send(queue.peer(), batch).await {
            Ok(()) => {
                incr(&stats.batches_sent);
                return;
            }
            Err(e) => {
                tracing::debug!(peer = queue.peer(), attempt, error = %e, "Batch send failed");
                if attempt == attempts {
                    incr(&stats.batches_dropped);
                    tracing::error!(
                        peer = queue.peer(),
                        attempts,
                        size = batch.len(),
                        error = %e,
                        "Dropping batch after retries"
                    );
                    return;
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(config.send_retry_interval) => {}
            _ = shutdown.recv() => {
                incr(&stats.batches_dropped);
                tracing::warn!(peer = queue.peer(), size = batch.len(), "Dropping batch on shutdown");
                return;
            }
        }
    }
}
