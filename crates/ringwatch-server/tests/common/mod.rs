#![allow(dead_code)]

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use ringwatch_alert::NotifyRequest;
use ringwatch_common::shutdown::{self, ShutdownTrigger};
use ringwatch_server::app::{self, Components};
use ringwatch_server::config::EvaluatorConfig;
use ringwatch_storage::{AlertRuleRow, ConfigStore, SqliteConfigStore};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::util::ServiceExt;

pub const INSTANCE_ID: &str = "eval-test";

pub struct TestContext {
    pub temp_dir: TempDir,
    pub store: Arc<dyn ConfigStore>,
    pub components: Components,
    pub app: axum::Router,
    pub notify_rx: mpsc::Receiver<NotifyRequest>,
    pub trigger: ShutdownTrigger,
}

impl TestContext {
    /// Installs a rule and reloads the rule snapshot.
    pub fn install(&self, row: AlertRuleRow) {
        self.store.upsert_rule(&row).expect("rule should persist");
        self.components.rules.refresh().expect("rules should load");
    }

    pub fn drain(&mut self) -> Vec<NotifyRequest> {
        let mut out = Vec::new();
        while let Ok(req) = self.notify_rx.try_recv() {
            out.push(req);
        }
        out
    }
}

pub fn test_config(temp_dir: &TempDir) -> EvaluatorConfig {
    let mut config = EvaluatorConfig::default();
    config.instance_id = INSTANCE_ID.to_string();
    config.advertise = "http://127.0.0.1:1".to_string();
    config.store = temp_dir
        .path()
        .join("ringwatch.db")
        .to_string_lossy()
        .to_string();
    config
}

pub fn build_test_context() -> Result<TestContext> {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(&temp_dir);
    build_test_context_with(temp_dir, config)
}

pub fn build_test_context_with(temp_dir: TempDir, config: EvaluatorConfig) -> Result<TestContext> {
    let store: Arc<dyn ConfigStore> =
        Arc::new(SqliteConfigStore::open(std::path::Path::new(&config.store))?);
    let (trigger, signal) = shutdown::channel();
    let (components, notify_rx) = Components::build(&config, store.clone(), signal)?;
    let app = app::build_http_app(components.state());
    Ok(TestContext {
        temp_dir,
        store,
        components,
        app,
        notify_rx,
        trigger,
    })
}

pub fn threshold_rule(id: i64, metric: &str, op: &str, threshold: f64) -> AlertRuleRow {
    AlertRuleRow {
        id,
        name: format!("rule-{id}"),
        cluster: "*ALL*".to_string(),
        severity: 2,
        disabled: false,
        rule_type: "threshold".to_string(),
        config_json: serde_json::json!({ "metric": metric, "op": op, "threshold": threshold })
            .to_string(),
        group_by: String::new(),
        for_duration: 0,
        recovery_duration: 0,
        eval_interval: 10,
        append_tags: String::new(),
        notify_channels: "email".to_string(),
        notify_groups: "ops".to_string(),
        notify_repeat_step: 0,
        notify_max_number: 0,
        notify_on_recover: true,
        enable_days_of_week: String::new(),
        enable_stime: String::new(),
        enable_etime: String::new(),
        update_at: 1,
    }
}

pub async fn request_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value, Option<String>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let req_body = match body {
        Some(body) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let req = builder.body(req_body).expect("request should build");

    let resp = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should be handled");

    let status = resp.status();
    let trace_id = resp
        .headers()
        .get("x-trace-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    let bytes = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, json, trace_id)
}
