use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved tag carrying the source identity for non-host producers.
pub const IDENT_TAG: &str = "__ident__";
/// Reserved tag carrying a display alias for the source.
pub const ALIAS_TAG: &str = "__alias__";

/// A single sample as accepted by ingest and routed between peers.
///
/// `tags_sorted` and `fingerprint` are derived during ingest and travel with
/// the point so that the receiving peer does not recompute them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub alias: String,
    pub metric: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub value: f64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags_sorted: Vec<String>,
    #[serde(default)]
    pub fingerprint: Fingerprint,
}

impl MetricPoint {
    pub fn new(metric: &str, value: f64, timestamp: i64) -> Self {
        Self {
            ident: String::new(),
            alias: String::new(),
            metric: metric.to_string(),
            tags: HashMap::new(),
            value,
            timestamp,
            tags_sorted: Vec::new(),
            fingerprint: Fingerprint::default(),
        }
    }

    pub fn with_ident(mut self, ident: &str) -> Self {
        self.ident = ident.to_string();
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}

/// Alert severity level, ordered from lowest to highest.
///
/// Persisted as the numeric level where `1` is the most urgent.
///
/// # Examples
///
/// ```
/// use ringwatch_common::types::Severity;
///
/// let sev = Severity::from_level(2).unwrap();
/// assert_eq!(sev, Severity::Warning);
/// assert_eq!(sev.level(), 2);
/// assert!(Severity::Critical > Severity::Info);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            1 => Some(Severity::Critical),
            2 => Some(Severity::Warning),
            3 => Some(Severity::Info),
            _ => None,
        }
    }

    pub fn level(self) -> i64 {
        match self {
            Severity::Critical => 1,
            Severity::Warning => 2,
            Severity::Info => 3,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" | "3" => Ok(Severity::Info),
            "warning" | "2" => Ok(Severity::Warning),
            "critical" | "1" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Renders tags as `k=v` pairs sorted by key.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use ringwatch_common::types::sorted_tag_pairs;
///
/// let mut tags = HashMap::new();
/// tags.insert("region".to_string(), "bj".to_string());
/// tags.insert("app".to_string(), "api".to_string());
/// assert_eq!(sorted_tag_pairs(&tags), vec!["app=api", "region=bj"]);
/// ```
pub fn sorted_tag_pairs(tags: &HashMap<String, String>) -> Vec<String> {
    let mut keys: Vec<&String> = tags.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|k| format!("{k}={}", tags[k]))
        .collect()
}

/// Serializes tags as whitespace-separated `k=v` tokens, the column format
/// shared with the configuration store.
pub fn tags_to_string(tags: &HashMap<String, String>) -> String {
    sorted_tag_pairs(tags).join(" ")
}

/// Parses whitespace-separated `k=v` tokens. Empty tokens and tokens without
/// `=` or with an empty key are ignored.
pub fn parse_tags(s: &str) -> HashMap<String, String> {
    s.split_whitespace()
        .filter_map(|token| {
            let (k, v) = token.split_once('=')?;
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

/// Parses a whitespace-separated word list, skipping empty tokens.
pub fn parse_words(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

/// Formats a sample value with at most five decimals and no trailing zeros.
pub fn readable_value(value: f64) -> String {
    let s = format!("{value:.5}");
    let s = s.trim_end_matches('0');
    s.trim_end_matches('.').to_string()
}
