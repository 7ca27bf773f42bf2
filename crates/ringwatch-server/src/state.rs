use crate::ingest::Ingest;
use chrono::{DateTime, Utc};
use ringwatch_alert::{EventStore, RuleStore};
use ringwatch_cluster::{PointSink, RingHandle};
use ringwatch_common::stats::Stats;
use std::sync::Arc;

/// Shared handles the HTTP handlers work with.
#[derive(Clone)]
pub struct AppState {
    pub instance_id: String,
    pub cluster: String,
    pub ingest: Arc<Ingest>,
    /// Receives points forwarded by peers.
    pub local: Arc<dyn PointSink>,
    pub ring: Arc<RingHandle>,
    pub rules: Arc<RuleStore>,
    pub events: Arc<EventStore>,
    pub stats: Arc<Stats>,
    pub start_time: DateTime<Utc>,
}
