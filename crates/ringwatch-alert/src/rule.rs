use crate::error::{AlertError, Result};
use crate::filter::{compile_all, matches_all, TagFilter, TagFilterSpec};
use crate::predicate::{Aggregate, CompareOp, Predicate};
use chrono::{Datelike, Local, NaiveDateTime, TimeZone, Timelike};
use ringwatch_common::fingerprint::md5_hex;
use ringwatch_common::types::{parse_tags, parse_words, MetricPoint, Severity};
use ringwatch_storage::AlertRuleRow;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Reserved scope token matching every cluster.
pub const CLUSTER_WILDCARD: &str = "*ALL*";

/// Shortest window retention regardless of rule durations.
pub const MIN_RETENTION_SECS: i64 = 600;

/// Set of cluster tags a rule or mute applies to.
///
/// # Examples
///
/// ```
/// use ringwatch_alert::rule::ClusterScope;
///
/// assert!(ClusterScope::parse("east west").matches("west"));
/// assert!(!ClusterScope::parse("east").matches("west"));
/// assert!(ClusterScope::parse("east *ALL*").matches("anything"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterScope {
    pub all: bool,
    pub clusters: HashSet<String>,
}

impl ClusterScope {
    pub fn parse(s: &str) -> Self {
        let mut scope = Self::default();
        for word in parse_words(s) {
            if word == CLUSTER_WILDCARD {
                scope.all = true;
            } else {
                scope.clusters.insert(word);
            }
        }
        scope
    }

    pub fn matches(&self, cluster: &str) -> bool {
        self.all || self.clusters.contains(cluster)
    }
}

/// Day-of-week and time-of-day gate.
///
/// Days are numbered `0` (Sunday) to `6`. Times are minutes since midnight;
/// a start after the end spans midnight. An empty day list means every day
/// and missing times mean the whole day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnableWindow {
    days: Vec<u32>,
    start: Option<u32>,
    end: Option<u32>,
}

impl EnableWindow {
    pub fn parse(days: &str, start: &str, end: &str) -> Result<Self> {
        let days = days
            .split_whitespace()
            .map(|d| match d.parse::<u32>() {
                Ok(n) if n <= 6 => Ok(n),
                _ => Err(AlertError::Configuration(format!(
                    "invalid enable day '{d}'"
                ))),
            })
            .collect::<Result<Vec<u32>>>()?;
        Ok(Self {
            days,
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }

    /// Whether evaluation may advance at unix time `ts`, in local time.
    pub fn is_active(&self, ts: i64) -> bool {
        if self.days.is_empty() && self.start.is_none() && self.end.is_none() {
            return true;
        }
        match Local.timestamp_opt(ts, 0).single() {
            Some(dt) => self.is_active_at(dt.naive_local()),
            None => true,
        }
    }

    pub fn is_active_at(&self, at: NaiveDateTime) -> bool {
        let day = at.weekday().num_days_from_sunday();
        if !self.days.is_empty() && !self.days.contains(&day) {
            return false;
        }
        let minute = at.hour() * 60 + at.minute();
        let start = self.start.unwrap_or(0);
        let end = self.end.unwrap_or(24 * 60 - 1);
        if start <= end {
            minute >= start && minute <= end
        } else {
            minute >= start || minute <= end
        }
    }
}

fn parse_hhmm(s: &str) -> Result<Option<u32>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let invalid = || AlertError::Configuration(format!("invalid time of day '{s}'"));
    let (h, m) = s.split_once(':').ok_or_else(invalid)?;
    let h: u32 = h.parse().map_err(|_| invalid())?;
    let m: u32 = m.parse().map_err(|_| invalid())?;
    if h > 23 || m > 59 {
        return Err(invalid());
    }
    Ok(Some(h * 60 + m))
}

// ---- Per-rule-type config JSON schemas ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub metric: String,
    #[serde(default)]
    pub tag_filters: Vec<TagFilterSpec>,
    #[serde(default = "default_aggregate")]
    pub aggregate: String,
    pub op: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeQueryConfig {
    pub expr: String,
    #[serde(default = "default_aggregate")]
    pub aggregate: String,
    pub op: String,
    pub threshold: f64,
    /// How far back each query reaches; defaults to
    /// `for_duration + eval_interval`.
    #[serde(default)]
    pub lookback_secs: Option<i64>,
}

fn default_aggregate() -> String {
    "all".to_string()
}

/// What a rule evaluates.
#[derive(Debug, Clone)]
pub enum RuleKind {
    /// Fed by incoming points of `metric` whose tags pass `filters`.
    Threshold {
        metric: String,
        filters: Vec<TagFilter>,
    },
    /// Polled from the TSDB every `eval_interval`.
    RangeQuery { expr: String, lookback_secs: i64 },
}

/// An enabled rule compiled into evaluation form.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub cluster_scope: ClusterScope,
    pub severity: Severity,
    pub kind: RuleKind,
    pub predicate: Predicate,
    pub group_by: Vec<String>,
    pub for_duration: i64,
    pub recovery_duration: i64,
    pub eval_interval: i64,
    pub append_tags: HashMap<String, String>,
    pub notify_channels: Vec<String>,
    pub notify_groups: Vec<String>,
    /// Seconds between repeat notifications; `0` disables repeats.
    pub notify_repeat_step: i64,
    /// Cap on notifications per event; `0` means unlimited.
    pub notify_max_number: i64,
    pub notify_on_recover: bool,
    pub enable: EnableWindow,
    pub update_at: i64,
}

impl Rule {
    /// Compiles a stored row. Any malformed part makes the whole rule a
    /// configuration error.
    pub fn from_row(row: &AlertRuleRow) -> Result<Self> {
        let severity = Severity::from_level(row.severity).ok_or_else(|| {
            AlertError::Configuration(format!("invalid severity {}", row.severity))
        })?;
        if row.for_duration < 0 || row.recovery_duration < 0 {
            return Err(AlertError::Configuration(
                "durations must not be negative".to_string(),
            ));
        }
        if row.eval_interval <= 0 {
            return Err(AlertError::Configuration(format!(
                "eval_interval must be positive, got {}",
                row.eval_interval
            )));
        }

        let (kind, predicate) = match row.rule_type.as_str() {
            "threshold" => {
                let cfg: ThresholdConfig = serde_json::from_str(&row.config_json)?;
                if cfg.metric.is_empty() {
                    return Err(AlertError::Configuration(
                        "threshold rule without metric".to_string(),
                    ));
                }
                let predicate = build_predicate(&cfg.aggregate, &cfg.op, cfg.threshold)?;
                let kind = RuleKind::Threshold {
                    metric: cfg.metric,
                    filters: compile_all(&cfg.tag_filters)?,
                };
                (kind, predicate)
            }
            "range_query" => {
                let cfg: RangeQueryConfig = serde_json::from_str(&row.config_json)?;
                if cfg.expr.trim().is_empty() {
                    return Err(AlertError::Configuration(
                        "range_query rule without expression".to_string(),
                    ));
                }
                let predicate = build_predicate(&cfg.aggregate, &cfg.op, cfg.threshold)?;
                let lookback_secs = cfg
                    .lookback_secs
                    .unwrap_or(row.for_duration + row.eval_interval)
                    .max(row.eval_interval);
                let kind = RuleKind::RangeQuery {
                    expr: cfg.expr,
                    lookback_secs,
                };
                (kind, predicate)
            }
            other => {
                return Err(AlertError::Configuration(format!(
                    "unknown rule type '{other}'"
                )))
            }
        };

        let group_by = parse_words(&row.group_by);
        if matches!(kind, RuleKind::Threshold { .. }) && !group_by.is_empty() {
            // Push series are owned per fingerprint, so a group spanning
            // several fingerprints would be split across peers.
            return Err(AlertError::Configuration(
                "group_by is only supported on range_query rules".to_string(),
            ));
        }

        Ok(Self {
            id: row.id,
            name: row.name.clone(),
            cluster_scope: ClusterScope::parse(&row.cluster),
            severity,
            kind,
            predicate,
            group_by,
            for_duration: row.for_duration,
            recovery_duration: row.recovery_duration,
            eval_interval: row.eval_interval,
            append_tags: parse_tags(&row.append_tags),
            notify_channels: parse_words(&row.notify_channels),
            notify_groups: parse_words(&row.notify_groups),
            notify_repeat_step: row.notify_repeat_step.max(0),
            notify_max_number: row.notify_max_number.max(0),
            notify_on_recover: row.notify_on_recover,
            enable: EnableWindow::parse(
                &row.enable_days_of_week,
                &row.enable_stime,
                &row.enable_etime,
            )?,
            update_at: row.update_at,
        })
    }

    pub fn is_push(&self) -> bool {
        matches!(self.kind, RuleKind::Threshold { .. })
    }

    /// Metric a push rule listens to.
    pub fn metric(&self) -> Option<&str> {
        match &self.kind {
            RuleKind::Threshold { metric, .. } => Some(metric),
            RuleKind::RangeQuery { .. } => None,
        }
    }

    /// How long a series window must keep samples for this rule.
    pub fn retention(&self) -> i64 {
        (self.for_duration.max(self.recovery_duration) + self.eval_interval)
            .max(MIN_RETENTION_SECS)
    }

    /// Whether a push rule wants `point`.
    pub fn accepts(&self, point: &MetricPoint) -> bool {
        match &self.kind {
            RuleKind::Threshold { metric, filters } => {
                *metric == point.metric && matches_all(filters, &point.tags)
            }
            RuleKind::RangeQuery { .. } => false,
        }
    }

    /// Series identity of `point`: its fingerprint, which is also what
    /// routes the point to its owning peer.
    pub fn series_hash_of_point(&self, point: &MetricPoint) -> String {
        point.fingerprint.to_hex()
    }

    /// Series identity of a labelled TSDB series within this rule. Series
    /// sharing the `group_by` tags collapse into one.
    pub fn series_hash_of_labels(&self, labels: &HashMap<String, String>) -> String {
        if self.group_by.is_empty() {
            let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
            pairs.sort();
            let refs: Vec<&str> = pairs.iter().map(String::as_str).collect();
            return md5_hex(&refs);
        }
        self.grouped_hash(|key| labels.get(key).map(String::as_str))
    }

    fn grouped_hash<'a>(&self, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
        let mut keys: Vec<&String> = self.group_by.iter().collect();
        keys.sort();
        let pairs: Vec<String> = keys
            .into_iter()
            .map(|k| format!("{k}={}", lookup(k.as_str()).unwrap_or("")))
            .collect();
        let refs: Vec<&str> = pairs.iter().map(String::as_str).collect();
        md5_hex(&refs)
    }

    /// Tags recorded on an event: the series tags, the source identity, the
    /// rule name and the rule's appended tags.
    pub fn event_tags(&self, series_tags: &HashMap<String, String>, ident: &str) -> HashMap<String, String> {
        let mut tags = series_tags.clone();
        if !ident.is_empty() {
            tags.insert("ident".to_string(), ident.to_string());
        }
        tags.insert("rulename".to_string(), self.name.clone());
        for (k, v) in &self.append_tags {
            tags.insert(k.clone(), v.clone());
        }
        tags
    }
}

fn build_predicate(aggregate: &str, op: &str, threshold: f64) -> Result<Predicate> {
    if !threshold.is_finite() {
        return Err(AlertError::Configuration(format!(
            "threshold must be finite, got {threshold}"
        )));
    }
    Ok(Predicate {
        aggregate: aggregate.parse::<Aggregate>()?,
        op: op.parse::<CompareOp>()?,
        threshold,
    })
}

/// Identity of the active event of `(rule_id, series_hash)`.
pub fn event_hash(rule_id: i64, series_hash: &str) -> String {
    let id = rule_id.to_string();
    md5_hex(&[id.as_str(), series_hash])
}
