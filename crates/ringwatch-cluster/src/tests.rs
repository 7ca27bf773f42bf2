use crate::error::{ClusterError, Result};
use crate::membership::{Membership, MembershipConfig, Peer, Roster};
use crate::queue::DispatchQueue;
use crate::ring::{rule_key, HashRing, RingHandle};
use crate::{BatchSender, DispatchConfig, Dispatcher, PointSink};
use async_trait::async_trait;
use ringwatch_common::fingerprint::Fingerprint;
use ringwatch_common::shutdown;
use ringwatch_common::stats::Stats;
use ringwatch_common::types::MetricPoint;
use ringwatch_storage::error::StorageError;
use ringwatch_storage::{
    AlertMuteRow, AlertRuleRow, ConfigStore, CurEventRow, HeartbeatRow, HisEventRow,
    SqliteConfigStore, TargetRow,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn point(i: usize) -> MetricPoint {
    let mut p = MetricPoint::new("cpu_util", i as f64, 1_700_000_000).with_ident(&format!("host-{i}"));
    p.fingerprint = Fingerprint::compute(&p.ident, &p.metric, &[]);
    p
}

// ---- HashRing ----

#[test]
fn single_peer_owns_everything() {
    let ring = HashRing::new(&ids(&["only"]), 500);
    for i in 0..1000 {
        assert_eq!(ring.get(point(i).fingerprint.ring_key()), Some("only"));
    }
}

#[test]
fn ring_is_deterministic_across_rebuilds() {
    let a = HashRing::new(&ids(&["p3", "p1", "p2"]), 500);
    let b = HashRing::new(&ids(&["p1", "p2", "p3", "p2"]), 500);
    assert_eq!(a.members(), b.members());
    for i in 0..2000 {
        let key = point(i).fingerprint.ring_key();
        assert_eq!(a.get(key), b.get(key));
    }
}

#[test]
fn removing_a_peer_only_moves_its_keys() {
    let before = HashRing::new(&ids(&["p1", "p2", "p3"]), 500);
    let after = HashRing::new(&ids(&["p1", "p3"]), 500);

    let mut owned: HashMap<String, usize> = HashMap::new();
    for i in 0..10_000 {
        let key = point(i).fingerprint.ring_key();
        let old = before.get(key).unwrap();
        let new = after.get(key).unwrap();
        *owned.entry(old.to_string()).or_default() += 1;
        if old == "p2" {
            assert!(new == "p1" || new == "p3");
        } else {
            assert_eq!(old, new, "key owned by {old} moved to {new}");
        }
    }
    for peer in ["p1", "p2", "p3"] {
        let share = owned[peer] as f64 / 10_000.0;
        assert!(share > 0.25 && share < 0.42, "{peer} owns {share}");
    }
}

#[test]
fn empty_ring_has_no_owner() {
    let handle = RingHandle::new(500);
    assert!(handle.load().get(7).is_none());
    assert!(handle.is_owner(7, "anyone"));
}

#[test]
fn ring_handle_swaps_only_on_change() {
    let handle = RingHandle::new(64);
    assert!(handle.rebuild(&ids(&["b", "a"])));
    let first = handle.load();
    assert!(!handle.rebuild(&ids(&["a", "b"])));
    assert!(Arc::ptr_eq(&first, &handle.load()));
    assert!(handle.rebuild(&ids(&["a"])));
    assert!(handle.is_owner(rule_key(42), "a"));
    // Readers keep the ring they loaded.
    assert_eq!(first.members(), ids(&["a", "b"]).as_slice());
}

// ---- DispatchQueue ----

#[test]
fn queue_drops_oldest_on_overflow() {
    let queue = DispatchQueue::new("p1", 3);
    let names = ["A", "B", "C", "D", "E"];
    for name in names {
        queue.push(MetricPoint::new(name, 0.0, 0));
    }
    let out: Vec<String> = queue.pop_batch(10).into_iter().map(|p| p.metric).collect();
    assert_eq!(out, vec!["C", "D", "E"]);
    assert_eq!(queue.dropped(), 2);
    assert!(queue.is_empty());
}

#[test]
fn pop_batch_respects_limit() {
    let queue = DispatchQueue::new("p1", 10);
    for i in 0..5 {
        queue.push(point(i));
    }
    assert_eq!(queue.pop_batch(2).len(), 2);
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.drain_all().len(), 3);
}

#[tokio::test]
async fn ready_wakes_after_push_without_waiter() {
    let queue = DispatchQueue::new("p1", 10);
    queue.push(point(1));
    tokio::time::timeout(Duration::from_secs(1), queue.ready())
        .await
        .unwrap();
}

// ---- Membership ----

struct FlakyHeartbeats {
    inner: SqliteConfigStore,
    fail: AtomicBool,
}

impl FlakyHeartbeats {
    fn check(&self) -> ringwatch_storage::error::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected".to_string()));
        }
        Ok(())
    }
}

impl ConfigStore for FlakyHeartbeats {
    fn upsert_heartbeat(&self, row: &HeartbeatRow) -> ringwatch_storage::error::Result<()> {
        self.check()?;
        self.inner.upsert_heartbeat(row)
    }
    fn list_heartbeats(&self, cluster: &str) -> ringwatch_storage::error::Result<Vec<HeartbeatRow>> {
        self.check()?;
        self.inner.list_heartbeats(cluster)
    }
    fn list_enabled_rules(&self) -> ringwatch_storage::error::Result<Vec<AlertRuleRow>> {
        self.inner.list_enabled_rules()
    }
    fn upsert_rule(&self, row: &AlertRuleRow) -> ringwatch_storage::error::Result<()> {
        self.inner.upsert_rule(row)
    }
    fn delete_rules(&self, ids: &[i64]) -> ringwatch_storage::error::Result<usize> {
        self.inner.delete_rules(ids)
    }
    fn list_mutes(&self) -> ringwatch_storage::error::Result<Vec<AlertMuteRow>> {
        self.inner.list_mutes()
    }
    fn upsert_mute(&self, row: &AlertMuteRow) -> ringwatch_storage::error::Result<()> {
        self.inner.upsert_mute(row)
    }
    fn delete_mutes(&self, ids: &[i64]) -> ringwatch_storage::error::Result<usize> {
        self.inner.delete_mutes(ids)
    }
    fn get_target(&self, ident: &str) -> ringwatch_storage::error::Result<Option<TargetRow>> {
        self.inner.get_target(ident)
    }
    fn upsert_target(&self, row: &TargetRow) -> ringwatch_storage::error::Result<()> {
        self.inner.upsert_target(row)
    }
    fn upsert_cur_event(&self, row: &CurEventRow) -> ringwatch_storage::error::Result<()> {
        self.inner.upsert_cur_event(row)
    }
    fn delete_cur_events(&self, hashes: &[String]) -> ringwatch_storage::error::Result<usize> {
        self.inner.delete_cur_events(hashes)
    }
    fn list_cur_events(&self, owner: &str) -> ringwatch_storage::error::Result<Vec<CurEventRow>> {
        self.inner.list_cur_events(owner)
    }
    fn insert_his_event(&self, row: &HisEventRow) -> ringwatch_storage::error::Result<i64> {
        self.inner.insert_his_event(row)
    }
    fn list_his_events(&self, rule_id: i64) -> ringwatch_storage::error::Result<Vec<HisEventRow>> {
        self.inner.list_his_events(rule_id)
    }
}

fn membership_config(id: &str) -> MembershipConfig {
    MembershipConfig {
        instance_id: id.to_string(),
        cluster: "default".to_string(),
        endpoint: format!("http://{id}:9400"),
        heartbeat_interval: Duration::from_millis(20),
        liveness_ttl: Duration::from_secs(10),
    }
}

fn heartbeat(id: &str, cluster: &str, ts: i64) -> HeartbeatRow {
    HeartbeatRow {
        instance_id: id.to_string(),
        cluster: cluster.to_string(),
        endpoint: format!("http://{id}:9400"),
        last_heartbeat_ts: ts,
    }
}

#[test]
fn roster_contains_alive_peers_of_own_cluster() {
    let store = Arc::new(SqliteConfigStore::open_in_memory().unwrap());
    let now = 1_000;
    store.upsert_heartbeat(&heartbeat("p3", "default", now - 2)).unwrap();
    store.upsert_heartbeat(&heartbeat("p1", "default", now - 10)).unwrap();
    store.upsert_heartbeat(&heartbeat("stale", "default", now - 11)).unwrap();
    store.upsert_heartbeat(&heartbeat("east", "other", now)).unwrap();

    let membership = Membership::new(membership_config("p2"), store.clone(), Arc::new(Stats::default()));
    let roster = membership.heartbeat_once(now).unwrap();
    assert_eq!(roster.ids(), ids(&["p1", "p2", "p3"]));
    assert_eq!(roster.endpoint("p3"), Some("http://p3:9400"));

    let own = store
        .list_heartbeats("default")
        .unwrap()
        .into_iter()
        .find(|r| r.instance_id == "p2")
        .unwrap();
    assert_eq!(own.last_heartbeat_ts, now);
}

#[test]
fn live_duplicate_instance_is_fatal() {
    let store = Arc::new(SqliteConfigStore::open_in_memory().unwrap());
    let mut row = heartbeat("p1", "default", 995);
    row.endpoint = "http://elsewhere:9400".to_string();
    store.upsert_heartbeat(&row).unwrap();

    let membership = Membership::new(membership_config("p1"), store, Arc::new(Stats::default()));
    let err = membership.heartbeat_once(1_000).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, ClusterError::DuplicateInstance { .. }));
}

#[test]
fn stale_row_with_same_id_is_taken_over() {
    let store = Arc::new(SqliteConfigStore::open_in_memory().unwrap());
    let mut row = heartbeat("p1", "default", 900);
    row.endpoint = "http://old-host:9400".to_string();
    store.upsert_heartbeat(&row).unwrap();

    let membership = Membership::new(membership_config("p1"), store, Arc::new(Stats::default()));
    let roster = membership.heartbeat_once(1_000).unwrap();
    assert_eq!(roster.endpoint("p1"), Some("http://p1:9400"));
}

#[test]
fn failed_heartbeat_keeps_previous_roster() {
    let store = Arc::new(FlakyHeartbeats {
        inner: SqliteConfigStore::open_in_memory().unwrap(),
        fail: AtomicBool::new(false),
    });
    store.inner.upsert_heartbeat(&heartbeat("p2", "default", 1_000)).unwrap();
    let membership = Membership::new(membership_config("p1"), store.clone(), Arc::new(Stats::default()));
    let rx = membership.subscribe();

    membership.heartbeat_once(1_000).unwrap();
    assert_eq!(rx.borrow().ids(), ids(&["p1", "p2"]));

    store.fail.store(true, Ordering::SeqCst);
    assert!(membership.heartbeat_once(1_050).is_err());
    assert_eq!(membership.roster().ids(), ids(&["p1", "p2"]));
}

#[tokio::test]
async fn membership_loop_counts_store_errors_and_stops_on_shutdown() {
    let store = Arc::new(FlakyHeartbeats {
        inner: SqliteConfigStore::open_in_memory().unwrap(),
        fail: AtomicBool::new(true),
    });
    let stats = Arc::new(Stats::default());
    let membership = Arc::new(Membership::new(membership_config("p1"), store, stats.clone()));
    let (trigger, signal) = shutdown::channel();
    let handle = tokio::spawn(membership.run(signal));

    tokio::time::sleep(Duration::from_millis(300)).await;
    trigger.trigger();
    handle.await.unwrap().unwrap();
    assert!(stats.snapshot().store_errors >= 1);
}

// ---- Dispatcher ----

#[derive(Default)]
struct RecordingSender {
    batches: Mutex<Vec<(String, usize)>>,
    calls: AtomicUsize,
    fail: AtomicBool,
    forgotten: Mutex<Vec<String>>,
}

impl RecordingSender {
    fn points_sent(&self) -> usize {
        self.batches.lock().unwrap().iter().map(|(_, n)| n).sum()
    }
}

#[async_trait]
impl BatchSender for RecordingSender {
    async fn send(&self, peer: &str, points: &[MetricPoint]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClusterError::UnknownPeer(peer.to_string()));
        }
        self.batches
            .lock()
            .unwrap()
            .push((peer.to_string(), points.len()));
        Ok(())
    }

    fn forget(&self, peer: &str) {
        self.forgotten.lock().unwrap().push(peer.to_string());
    }
}

#[derive(Default)]
struct CollectingSink {
    points: Mutex<Vec<MetricPoint>>,
}

#[async_trait]
impl PointSink for CollectingSink {
    async fn deliver(&self, points: Vec<MetricPoint>) {
        self.points.lock().unwrap().extend(points);
    }
}

fn roster(names: &[&str]) -> Roster {
    Roster::new(
        names
            .iter()
            .map(|n| Peer {
                instance_id: n.to_string(),
                endpoint: format!("http://{n}:9400"),
            })
            .collect(),
    )
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    sender: Arc<RecordingSender>,
    sink: Arc<CollectingSink>,
    stats: Arc<Stats>,
    _trigger: shutdown::ShutdownTrigger,
}

fn harness(config: DispatchConfig) -> Harness {
    let sender = Arc::new(RecordingSender::default());
    let sink = Arc::new(CollectingSink::default());
    let stats = Arc::new(Stats::default());
    let (trigger, signal) = shutdown::channel();
    let dispatcher = Arc::new(Dispatcher::new(
        "self",
        config,
        Arc::new(RingHandle::new(500)),
        sender.clone(),
        sink.clone(),
        stats.clone(),
        signal,
    ));
    Harness {
        dispatcher,
        sender,
        sink,
        stats,
        _trigger: trigger,
    }
}

fn points_owned_by(ring: &HashRing, owner: &str, n: usize) -> Vec<MetricPoint> {
    (0..)
        .map(point)
        .filter(|p| ring.get(p.fingerprint.ring_key()) == Some(owner))
        .take(n)
        .collect()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn empty_ring_delivers_locally() {
    let h = harness(DispatchConfig::default());
    h.dispatcher.route((0..10).map(point).collect()).await;
    assert_eq!(h.sink.points.lock().unwrap().len(), 10);
    assert_eq!(h.stats.snapshot().points_local, 10);
}

#[tokio::test]
async fn remote_points_are_batched_to_owner() {
    let h = harness(DispatchConfig {
        read_batch: 4,
        ..DispatchConfig::default()
    });
    h.dispatcher.apply_roster(&roster(&["other", "self"])).await;
    let ring = h.dispatcher.ring().load();

    let mut points = points_owned_by(&ring, "other", 10);
    points.extend(points_owned_by(&ring, "self", 5));
    h.dispatcher.route(points).await;

    assert_eq!(h.sink.points.lock().unwrap().len(), 5);
    let sender = h.sender.clone();
    wait_until(|| sender.points_sent() == 10).await;
    let batches = h.sender.batches.lock().unwrap().clone();
    assert!(batches.iter().all(|(peer, n)| peer == "other" && *n <= 4));
    let snap = h.stats.snapshot();
    assert_eq!(snap.points_remote, 10);
    assert_eq!(snap.points_local, 5);
}

#[tokio::test]
async fn failing_batch_is_dropped_after_retries() {
    let h = harness(DispatchConfig {
        send_retries: 3,
        send_retry_interval: Duration::from_millis(5),
        ..DispatchConfig::default()
    });
    h.sender.fail.store(true, Ordering::SeqCst);
    h.dispatcher.apply_roster(&roster(&["other", "self"])).await;
    let ring = h.dispatcher.ring().load();
    h.dispatcher.route(points_owned_by(&ring, "other", 3)).await;

    let stats = h.stats.clone();
    wait_until(|| stats.snapshot().batches_dropped == 1).await;
    assert_eq!(h.sender.calls.load(Ordering::SeqCst), 3);
    // Not re-queued.
    assert_eq!(h.dispatcher.queue_len("other"), Some(0));
}

#[tokio::test]
async fn departed_peer_queue_is_rerouted() {
    let h = harness(DispatchConfig {
        read_batch: 1,
        send_retry_interval: Duration::from_secs(60),
        ..DispatchConfig::default()
    });
    h.sender.fail.store(true, Ordering::SeqCst);
    h.dispatcher.apply_roster(&roster(&["other", "self"])).await;
    let ring = h.dispatcher.ring().load();
    h.dispatcher.route(points_owned_by(&ring, "other", 3)).await;
    assert_eq!(h.dispatcher.queued_peers(), ids(&["other"]));

    h.dispatcher.apply_roster(&roster(&["self"])).await;
    assert!(h.dispatcher.queued_peers().is_empty());
    assert_eq!(h.sender.forgotten.lock().unwrap().clone(), ids(&["other"]));
    assert!(h.sink.points.lock().unwrap().len() >= 2);
}

#[tokio::test]
async fn queue_overflow_is_counted() {
    let h = harness(DispatchConfig {
        queue_max: 2,
        send_retry_interval: Duration::from_secs(60),
        ..DispatchConfig::default()
    });
    h.sender.fail.store(true, Ordering::SeqCst);
    h.dispatcher.apply_roster(&roster(&["other", "self"])).await;
    let ring = h.dispatcher.ring().load();
    h.dispatcher.route(points_owned_by(&ring, "other", 5)).await;
    assert_eq!(h.stats.snapshot().queue_dropped, 3);
}

#[tokio::test]
async fn shutdown_flushes_queued_points_once() {
    let sender = Arc::new(RecordingSender::default());
    let sink = Arc::new(CollectingSink::default());
    let stats = Arc::new(Stats::default());
    let (trigger, signal) = shutdown::channel();
    let dispatcher = Dispatcher::new(
        "self",
        DispatchConfig::default(),
        Arc::new(RingHandle::new(500)),
        sender.clone(),
        sink,
        stats,
        signal,
    );
    dispatcher.apply_roster(&roster(&["other", "self"])).await;
    let ring = dispatcher.ring().load();
    dispatcher.route(points_owned_by(&ring, "other", 7)).await;

    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(2), dispatcher.join_writers())
        .await
        .unwrap();
    assert_eq!(sender.points_sent(), 7);
}
