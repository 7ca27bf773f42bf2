use ringwatch_common::types::MetricPoint;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// Bounded FIFO of points waiting to be shipped to one peer.
///
/// Enqueue never blocks: when full, the oldest point is evicted to admit the
/// new one and the overflow counter is bumped.
#[derive(Debug)]
pub struct DispatchQueue {
    peer: String,
    capacity: usize,
    items: Mutex<VecDeque<MetricPoint>>,
    ready: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl DispatchQueue {
    pub fn new(peer: &str, capacity: usize) -> Self {
        Self {
            peer: peer.to_string(),
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_items(&self) -> MutexGuard<'_, VecDeque<MetricPoint>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Appends `point`. Returns `true` when an older point was evicted.
    pub fn push(&self, point: MetricPoint) -> bool {
        let evicted = {
            let mut items = self.lock_items();
            let evicted = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(point);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    /// Takes up to `max` points from the head.
    pub fn pop_batch(&self, max: usize) -> Vec<MetricPoint> {
        let mut items = self.lock_items();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    /// Takes everything left in the queue.
    pub fn drain_all(&self) -> Vec<MetricPoint> {
        self.lock_items().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of points evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Marks the queue closed and wakes its writer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits until a push or close happens. A wakeup issued while nobody
    /// waits is kept for the next call.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }
}
