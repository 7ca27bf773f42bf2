//! Evaluator process: point ingest, the peer forwarding endpoint, the
//! Prometheus range-query client, the notification consumer and the wiring
//! of the cluster and alert crates.

pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod notifier;
pub mod state;
pub mod tsdb;
