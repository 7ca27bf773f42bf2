use crate::config::{parse_duration, EvaluatorConfig};
use clap::Parser;
use std::time::Duration;

/// Distributed alert evaluator.
///
/// Flags override values from the configuration file.
#[derive(Debug, Parser)]
#[command(name = "ringwatch-evaluator", version)]
pub struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, env = "RINGWATCH_CONFIG")]
    pub config: Option<String>,

    #[arg(long, env = "RINGWATCH_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Address the HTTP endpoint binds to.
    #[arg(long, env = "RINGWATCH_LISTEN")]
    pub listen: Option<String>,

    /// Base URL peers use to reach this instance.
    #[arg(long, env = "RINGWATCH_ADVERTISE")]
    pub advertise: Option<String>,

    /// SQLite configuration store path.
    #[arg(long, env = "RINGWATCH_STORE")]
    pub store: Option<String>,

    /// Cluster tag this evaluator serves.
    #[arg(long, env = "RINGWATCH_CLUSTER")]
    pub cluster: Option<String>,

    #[arg(long, env = "RINGWATCH_HEARTBEAT_INTERVAL", value_parser = parse_duration)]
    pub heartbeat_interval: Option<Duration>,

    #[arg(long, env = "RINGWATCH_LIVENESS_TTL", value_parser = parse_duration)]
    pub liveness_ttl: Option<Duration>,

    /// Per-peer dispatch queue bound.
    #[arg(long, env = "RINGWATCH_QUEUE_MAX")]
    pub queue_max: Option<usize>,

    /// Points per forwarded batch.
    #[arg(long, env = "RINGWATCH_READ_BATCH")]
    pub read_batch: Option<usize>,

    #[arg(long, env = "RINGWATCH_NOTIFY_SCAN_INTERVAL", value_parser = parse_duration)]
    pub notify_scan_interval: Option<Duration>,

    #[arg(long, env = "RINGWATCH_RULE_REFRESH_INTERVAL", value_parser = parse_duration)]
    pub rule_refresh_interval: Option<Duration>,
}

impl Cli {
    /// Loads the configuration file (if any), applies flag overrides and
    /// validates the result.
    pub fn load_config(&self) -> anyhow::Result<EvaluatorConfig> {
        let mut config = match &self.config {
            Some(path) => EvaluatorConfig::load(path)
                .map_err(|e| anyhow::anyhow!("failed to load {path}: {e}"))?,
            None => EvaluatorConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut EvaluatorConfig) {
        if let Some(v) = &self.instance_id {
            config.instance_id = v.clone();
        }
        if let Some(v) = &self.listen {
            config.listen = v.clone();
        }
        if let Some(v) = &self.advertise {
            config.advertise = v.clone();
        }
        if let Some(v) = &self.store {
            config.store = v.clone();
        }
        if let Some(v) = &self.cluster {
            config.cluster.name = v.clone();
        }
        if let Some(v) = self.heartbeat_interval {
            config.cluster.heartbeat_interval = v;
        }
        if let Some(v) = self.liveness_ttl {
            config.cluster.liveness_ttl = v;
        }
        if let Some(v) = self.queue_max {
            config.dispatch.queue_max = v;
        }
        if let Some(v) = self.read_batch {
            config.dispatch.read_batch = v;
        }
        if let Some(v) = self.notify_scan_interval {
            config.alert.notify_scan_interval = v;
        }
        if let Some(v) = self.rule_refresh_interval {
            config.alert.rule_refresh_interval = v;
        }
    }
}
