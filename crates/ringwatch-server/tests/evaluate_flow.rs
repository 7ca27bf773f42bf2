mod common;

use axum::http::StatusCode;
use common::{build_test_context, request_json, threshold_rule, INSTANCE_ID};
use ringwatch_cluster::{PeerBatch, PEER_POINTS_PATH};
use ringwatch_common::fingerprint::Fingerprint;
use ringwatch_common::types::{sorted_tag_pairs, MetricPoint};
use ringwatch_storage::{AlertRuleRow, ConfigStore, HeartbeatRow};
use serde_json::json;

fn producer_point(metric: &str, ident: &str, value: f64, ts: i64) -> serde_json::Value {
    json!({
        "metric": metric,
        "tags": { "__ident__": ident, "mount": "/" },
        "value": value,
        "timestamp": ts,
    })
}

#[tokio::test]
async fn ingest_fires_and_recovers_through_http() {
    let mut ctx = build_test_context().unwrap();
    ctx.components.startup().await.unwrap();
    ctx.install(AlertRuleRow {
        append_tags: "team=infra".to_string(),
        ..threshold_rule(1, "disk_used", ">", 90.0)
    });
    let now = ringwatch_common::now_secs();

    let (status, body, trace_id) = request_json(
        &ctx.app,
        "POST",
        "/v1/ingest",
        Some(json!([producer_point("disk_used", "h1", 95.5, now - 60)])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["err_code"], 0);
    assert_eq!(body["data"]["accepted"], 1);
    assert!(trace_id.is_some());

    let fired = ctx.drain();
    assert_eq!(fired.len(), 1);
    assert!(!fired[0].is_recovery);
    assert_eq!(fired[0].trigger_value, "95.5");
    assert_eq!(fired[0].tags.get("team").map(String::as_str), Some("infra"));
    assert_eq!(ctx.components.events.len().await, 1);

    let (status, _, _) = request_json(
        &ctx.app,
        "POST",
        "/v1/ingest",
        Some(json!([producer_point("disk_used", "h1", 40.0, now)])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let recovered = ctx.drain();
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].is_recovery);
    assert_eq!(ctx.components.events.len().await, 0);
    assert_eq!(ctx.store.list_his_events(1).unwrap().len(), 1);

    let stats = ctx.components.stats.snapshot();
    assert_eq!(stats.points_received, 2);
    assert_eq!(stats.points_local, 2);
    assert_eq!(stats.events_fired, 1);
    assert_eq!(stats.events_recovered, 1);
}

#[tokio::test]
async fn partial_batch_reports_first_error() {
    let mut ctx = build_test_context().unwrap();
    ctx.components.startup().await.unwrap();
    ctx.install(threshold_rule(1, "cpu_util", ">", 80.0));
    let now = ringwatch_common::now_secs();

    let (status, body, _) = request_json(
        &ctx.app,
        "POST",
        "/v1/ingest",
        Some(json!([
            { "metric": "", "value": 1.0, "timestamp": now },
            producer_point("cpu_util", "h1", 99.0, now),
        ])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["accepted"], 1);
    assert_eq!(body["data"]["rejected"], 1);
    assert!(body["data"]["error"].as_str().unwrap().contains("empty"));
    assert_eq!(ctx.drain().len(), 1);
    assert_eq!(ctx.components.stats.snapshot().points_invalid, 1);
}

#[tokio::test]
async fn batch_without_valid_points_is_rejected() {
    let ctx = build_test_context().unwrap();
    ctx.components.startup().await.unwrap();
    let far_future = ringwatch_common::now_secs() + 86_400;

    let (status, body, _) = request_json(
        &ctx.app,
        "POST",
        "/v1/ingest",
        Some(json!([producer_point("cpu_util", "h1", 1.0, far_future)])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["err_code"], 1001);
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn peer_points_feed_the_local_evaluator() {
    let mut ctx = build_test_context().unwrap();
    ctx.components.startup().await.unwrap();
    ctx.install(threshold_rule(7, "mem_used", ">=", 90.0));

    let mut point = MetricPoint::new("mem_used", 97.0, ringwatch_common::now_secs()).with_ident("h9");
    point.tags_sorted = sorted_tag_pairs(&point.tags);
    point.fingerprint = Fingerprint::compute(&point.ident, &point.metric, &point.tags_sorted);
    let batch = PeerBatch {
        from: "eval-b".to_string(),
        points: vec![point],
    };

    let (status, body, _) = request_json(
        &ctx.app,
        "POST",
        PEER_POINTS_PATH,
        Some(serde_json::to_value(&batch).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["accepted"], 1);

    let fired = ctx.drain();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].rule_id, 7);
    // Forwarded points are not counted as ingested here.
    assert_eq!(ctx.components.stats.snapshot().points_received, 0);
}

#[tokio::test]
async fn health_reports_instance_and_ring() {
    let ctx = build_test_context().unwrap();
    ctx.components.startup().await.unwrap();

    let (status, body, trace_id) = request_json(&ctx.app, "GET", "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["instance_id"], INSTANCE_ID);
    assert_eq!(body["data"]["cluster"], "default");
    assert_eq!(body["data"]["ring_members"], json!([INSTANCE_ID]));
    assert_eq!(body["data"]["rules_version"], 1);
    assert_eq!(body["trace_id"].as_str(), trace_id.as_deref());
}

#[tokio::test]
async fn points_owned_by_a_peer_are_queued_for_it() {
    let ctx = build_test_context().unwrap();
    ctx.store
        .upsert_heartbeat(&HeartbeatRow {
            instance_id: "eval-other".to_string(),
            cluster: "default".to_string(),
            endpoint: "http://127.0.0.1:1".to_string(),
            last_heartbeat_ts: ringwatch_common::now_secs(),
        })
        .unwrap();
    ctx.components.startup().await.unwrap();
    assert_eq!(ctx.components.ring.load().members().len(), 2);

    let now = ringwatch_common::now_secs();
    let batch: Vec<_> = (0..64)
        .map(|i| producer_point("cpu_util", &format!("host-{i}"), 1.0, now))
        .collect();
    let (status, body, _) = request_json(&ctx.app, "POST", "/v1/ingest", Some(json!(batch))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["accepted"], 64);

    let stats = ctx.components.stats.snapshot();
    assert!(stats.points_local > 0);
    assert!(stats.points_remote > 0);
    assert_eq!(stats.points_local + stats.points_remote, 64);
    assert_eq!(ctx.components.dispatcher.queued_peers(), vec!["eval-other".to_string()]);
}

#[tokio::test]
async fn duplicate_instance_id_is_fatal_at_startup() {
    let ctx = build_test_context().unwrap();
    ctx.store
        .upsert_heartbeat(&HeartbeatRow {
            instance_id: INSTANCE_ID.to_string(),
            cluster: "default".to_string(),
            endpoint: "http://10.0.0.9:9400".to_string(),
            last_heartbeat_ts: ringwatch_common::now_secs(),
        })
        .unwrap();

    let err = ctx.components.startup().await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn restored_events_survive_a_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = common::test_config(&temp_dir);
    let now = ringwatch_common::now_secs();

    let mut first = common::build_test_context_with(temp_dir, config.clone()).unwrap();
    first.components.startup().await.unwrap();
    first.install(threshold_rule(3, "load1", ">", 4.0));
    first
        .components
        .ingest
        .ingest(
            vec![ringwatch_server::ingest::IngestPoint {
                metric: "load1".to_string(),
                ident: "h1".to_string(),
                value: 9.0,
                timestamp: now,
                ..Default::default()
            }],
            now,
        )
        .await;
    assert_eq!(first.drain().len(), 1);
    let temp_dir = first.temp_dir;

    let second = common::build_test_context_with(temp_dir, config).unwrap();
    second.components.startup().await.unwrap();
    let events = second.components.events.all().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].rule_id, 3);
}
