//! Configuration store used by the evaluator core.
//!
//! The core reads rules, mutes, host targets and the peer roster from the
//! store and writes heartbeats plus the two event tables. Everything else it
//! keeps in memory. [`engine::SqliteConfigStore`] is the bundled
//! implementation.

pub mod engine;
pub mod error;

#[cfg(test)]
mod tests;

use error::Result;
use serde::{Deserialize, Serialize};

pub use engine::SqliteConfigStore;

/// One row of the `heartbeat` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRow {
    pub instance_id: String,
    pub cluster: String,
    /// Base URL other peers use to reach this instance.
    pub endpoint: String,
    pub last_heartbeat_ts: i64,
}

/// One row of the `alert_rule` table.
///
/// `rule_type` selects the schema of `config_json`: `threshold` or
/// `range_query`. Word lists (`cluster`, `group_by`, `notify_*`) are
/// whitespace separated; `append_tags` holds `k=v` tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRuleRow {
    pub id: i64,
    pub name: String,
    pub cluster: String,
    pub severity: i64,
    pub disabled: bool,
    pub rule_type: String,
    pub config_json: String,
    pub group_by: String,
    pub for_duration: i64,
    pub recovery_duration: i64,
    pub eval_interval: i64,
    pub append_tags: String,
    pub notify_channels: String,
    pub notify_groups: String,
    pub notify_repeat_step: i64,
    pub notify_max_number: i64,
    pub notify_on_recover: bool,
    /// Day numbers, `0` = Sunday, e.g. `"1 2 3 4 5"`.
    pub enable_days_of_week: String,
    /// `HH:MM`
    pub enable_stime: String,
    /// `HH:MM`
    pub enable_etime: String,
    pub update_at: i64,
}

/// One row of the `alert_mute` table. `tags` holds a JSON array of
/// `{key, op, value}` filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMuteRow {
    pub id: i64,
    pub cluster: String,
    pub tags: String,
    pub cause: String,
    pub begin_ts: i64,
    pub end_ts: i64,
    pub disabled: bool,
}

/// One row of the `target` table: host identity and its host-level tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRow {
    pub ident: String,
    pub tags: String,
    pub note: String,
}

/// One row of the `alert_cur_event` table, keyed by `hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurEventRow {
    pub hash: String,
    pub rule_id: i64,
    pub series_hash: String,
    pub owner: String,
    pub cluster: String,
    pub severity: i64,
    pub first_trigger_ts: i64,
    pub last_eval_ts: i64,
    pub last_sent_ts: i64,
    pub notify_repeat_next_ts: i64,
    pub notify_count: i64,
    pub tags: String,
    pub trigger_value: String,
}

/// One row of the append-only `alert_his_event` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HisEventRow {
    pub id: i64,
    pub hash: String,
    pub rule_id: i64,
    pub series_hash: String,
    pub cluster: String,
    pub severity: i64,
    pub first_trigger_ts: i64,
    pub last_eval_ts: i64,
    pub last_sent_ts: i64,
    pub notify_count: i64,
    pub tags: String,
    pub trigger_value: String,
    pub recover_ts: i64,
}

/// Narrow read/write surface of the configuration store.
///
/// Implementations must be safe to share across threads (`Send + Sync`)
/// because membership, rule refresh, event persistence and ingest all reach
/// the store concurrently.
pub trait ConfigStore: Send + Sync {
    /// Inserts or replaces the heartbeat row of `row.instance_id`.
    fn upsert_heartbeat(&self, row: &HeartbeatRow) -> Result<()>;

    /// Lists heartbeat rows of one cluster.
    fn list_heartbeats(&self, cluster: &str) -> Result<Vec<HeartbeatRow>>;

    /// Lists every rule that is not disabled.
    fn list_enabled_rules(&self) -> Result<Vec<AlertRuleRow>>;

    fn upsert_rule(&self, row: &AlertRuleRow) -> Result<()>;

    fn delete_rules(&self, ids: &[i64]) -> Result<usize>;

    /// Lists every mute that is not disabled.
    fn list_mutes(&self) -> Result<Vec<AlertMuteRow>>;

    fn upsert_mute(&self, row: &AlertMuteRow) -> Result<()>;

    fn delete_mutes(&self, ids: &[i64]) -> Result<usize>;

    fn get_target(&self, ident: &str) -> Result<Option<TargetRow>>;

    fn upsert_target(&self, row: &TargetRow) -> Result<()>;

    /// Inserts or replaces the active event keyed by `row.hash`.
    fn upsert_cur_event(&self, row: &CurEventRow) -> Result<()>;

    fn delete_cur_events(&self, hashes: &[String]) -> Result<usize>;

    /// Lists active events written by `owner`.
    fn list_cur_events(&self, owner: &str) -> Result<Vec<CurEventRow>>;

    /// Appends a history row and returns its id.
    fn insert_his_event(&self, row: &HisEventRow) -> Result<i64>;

    /// Lists history rows of one rule, oldest first.
    fn list_his_events(&self, rule_id: i64) -> Result<Vec<HisEventRow>>;
}
