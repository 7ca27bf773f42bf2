//! Shared data model for the ringwatch evaluator.
//!
//! Metric points, severities, tag helpers, fingerprinting, retry backoff,
//! process-wide counters and the shutdown signal used by every long-lived loop.

pub mod backoff;
pub mod fingerprint;
pub mod shutdown;
pub mod stats;
pub mod types;

/// Current wall clock in unix seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
