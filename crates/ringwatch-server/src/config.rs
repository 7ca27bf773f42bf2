use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Unique id of this evaluator in the cluster. Defaults to the
    /// advertised endpoint when empty.
    #[serde(default)]
    pub instance_id: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base URL peers use to reach this instance.
    #[serde(default)]
    pub advertise: String,
    /// SQLite file backing the configuration store.
    #[serde(default = "default_store")]
    pub store: String,
    #[serde(default = "default_shutdown_grace", with = "duration_serde")]
    pub shutdown_grace: Duration,

    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub tsdb: TsdbConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            listen: default_listen(),
            advertise: String::new(),
            store: default_store(),
            shutdown_grace: default_shutdown_grace(),
            cluster: ClusterConfig::default(),
            pool: PoolSection::default(),
            dispatch: DispatchSection::default(),
            ingest: IngestConfig::default(),
            alert: AlertConfig::default(),
            tsdb: TsdbConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9400".to_string()
}

fn default_store() -> String {
    "data/ringwatch.db".to_string()
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster tag matched against rule and mute scopes.
    #[serde(default = "default_cluster_name")]
    pub name: String,
    #[serde(default = "default_heartbeat_interval", with = "duration_serde")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_liveness_ttl", with = "duration_serde")]
    pub liveness_ttl: Duration,
    #[serde(default = "default_vnodes")]
    pub vnodes: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            heartbeat_interval: default_heartbeat_interval(),
            liveness_ttl: default_liveness_ttl(),
            vnodes: default_vnodes(),
        }
    }
}

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_liveness_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_vnodes() -> usize {
    ringwatch_cluster::ring::DEFAULT_VNODES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_dial_timeout", with = "duration_serde")]
    pub dial_timeout: Duration,
    #[serde(default = "default_call_timeout", with = "duration_serde")]
    pub call_timeout: Duration,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_active: default_max_active(),
            max_idle: default_max_idle(),
            dial_timeout: default_dial_timeout(),
            call_timeout: default_call_timeout(),
        }
    }
}

fn default_max_active() -> usize {
    32
}

fn default_max_idle() -> usize {
    8
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,
    #[serde(default = "default_read_batch")]
    pub read_batch: usize,
    /// Total send attempts per batch before it is dropped.
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_send_retry_interval", with = "duration_serde")]
    pub send_retry_interval: Duration,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            queue_max: default_queue_max(),
            read_batch: default_read_batch(),
            send_retries: default_send_retries(),
            send_retry_interval: default_send_retry_interval(),
        }
    }
}

fn default_queue_max() -> usize {
    1_000_000
}

fn default_read_batch() -> usize {
    2_000
}

fn default_send_retries() -> u32 {
    15
}

fn default_send_retry_interval() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Largest accepted distance between a point's timestamp and the wall
    /// clock. Zero disables the check.
    #[serde(default = "default_max_offset", with = "duration_serde")]
    pub max_offset: Duration,
    /// Host tag entries kept in memory.
    #[serde(default = "default_identity_cache_size")]
    pub identity_cache_size: usize,
    /// How long a cached host tag entry is trusted.
    #[serde(default = "default_identity_cache_ttl", with = "duration_serde")]
    pub identity_cache_ttl: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_offset: default_max_offset(),
            identity_cache_size: default_identity_cache_size(),
            identity_cache_ttl: default_identity_cache_ttl(),
        }
    }
}

fn default_max_offset() -> Duration {
    Duration::from_secs(3600)
}

fn default_identity_cache_size() -> usize {
    100_000
}

fn default_identity_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_rule_refresh_interval", with = "duration_serde")]
    pub rule_refresh_interval: Duration,
    #[serde(default = "default_notify_scan_interval", with = "duration_serde")]
    pub notify_scan_interval: Duration,
    #[serde(default = "default_gc_interval", with = "duration_serde")]
    pub gc_interval: Duration,
    #[serde(default = "default_window_shards")]
    pub window_shards: usize,
    #[serde(default = "default_window_max_points")]
    pub window_max_points: usize,
    #[serde(default = "default_dead_letter_max")]
    pub dead_letter_max: usize,
    #[serde(default = "default_notify_buffer")]
    pub notify_buffer: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            rule_refresh_interval: default_rule_refresh_interval(),
            notify_scan_interval: default_notify_scan_interval(),
            gc_interval: default_gc_interval(),
            window_shards: default_window_shards(),
            window_max_points: default_window_max_points(),
            dead_letter_max: default_dead_letter_max(),
            notify_buffer: default_notify_buffer(),
        }
    }
}

fn default_rule_refresh_interval() -> Duration {
    Duration::from_secs(9)
}

fn default_notify_scan_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_window_shards() -> usize {
    ringwatch_alert::window::DEFAULT_SHARDS
}

fn default_window_max_points() -> usize {
    ringwatch_alert::window::DEFAULT_MAX_POINTS
}

fn default_dead_letter_max() -> usize {
    ringwatch_alert::event_store::DEFAULT_DEAD_LETTER_MAX
}

fn default_notify_buffer() -> usize {
    ringwatch_alert::notify::DEFAULT_NOTIFY_BUFFER
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsdbConfig {
    /// Prometheus-compatible base URL; range-query rules fail without it.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_tsdb_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: default_tsdb_timeout(),
        }
    }
}

fn default_tsdb_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Requests are POSTed here as JSON when set; otherwise only logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout: default_webhook_timeout(),
        }
    }
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(5)
}

impl EvaluatorConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Endpoint peers dial, derived from `listen` when not configured.
    pub fn advertise_url(&self) -> String {
        if !self.advertise.is_empty() {
            return self.advertise.trim_end_matches('/').to_string();
        }
        let listen = self.listen.replace("0.0.0.0", "127.0.0.1");
        format!("http://{listen}")
    }

    pub fn effective_instance_id(&self) -> String {
        if self.instance_id.is_empty() {
            self.advertise_url()
        } else {
            self.instance_id.clone()
        }
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cluster.name.trim().is_empty() {
            anyhow::bail!("cluster.name must not be empty");
        }
        if self.cluster.heartbeat_interval.is_zero() {
            anyhow::bail!("cluster.heartbeat_interval must be positive");
        }
        if self.cluster.liveness_ttl < self.cluster.heartbeat_interval {
            anyhow::bail!("cluster.liveness_ttl must be at least the heartbeat interval");
        }
        if self.cluster.vnodes == 0 {
            anyhow::bail!("cluster.vnodes must be positive");
        }
        if self.dispatch.queue_max == 0 || self.dispatch.read_batch == 0 {
            anyhow::bail!("dispatch.queue_max and dispatch.read_batch must be positive");
        }
        if self.alert.notify_buffer == 0 {
            anyhow::bail!("alert.notify_buffer must be positive");
        }
        Ok(())
    }
}

/// Parses `500ms`, `1s`, `2m`, `1h` or a bare number of seconds.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use ringwatch_server::config::parse_duration;
///
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
/// assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
/// assert!(parse_duration("soon").is_err());
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(n)),
        "ms" => Ok(Duration::from_millis(n)),
        "m" => Ok(Duration::from_secs(n.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(n.saturating_mul(3600))),
        other => Err(format!("unknown duration unit '{other}' in '{s}'")),
    }
}

/// Serde adapter accepting a duration string or a number of seconds.
pub mod duration_serde {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if d.subsec_millis() != 0 {
            s.serialize_str(&format!("{}ms", d.as_millis()))
        } else {
            s.serialize_str(&format!("{}s", d.as_secs()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Secs(n) => Ok(Duration::from_secs(n)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}
