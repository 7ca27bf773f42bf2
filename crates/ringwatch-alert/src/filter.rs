use crate::error::{AlertError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Stored form of a tag predicate, as found in mute rows and rule configs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilterSpec {
    pub key: String,
    pub op: String,
    #[serde(default)]
    pub value: String,
}

impl TagFilterSpec {
    pub fn new(key: &str, op: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            op: op.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
enum FilterOp {
    Eq(String),
    NotEq(String),
    Match(Regex),
    NotMatch(Regex),
    In(HashSet<String>),
    NotIn(HashSet<String>),
}

/// Compiled tag predicate.
///
/// Regexps are anchored to the whole value and `in` sets are built once from
/// the whitespace-separated value list. A key missing from the tags fails
/// `=`, `=~` and `in`, and passes the negated operators.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use ringwatch_alert::filter::{TagFilter, TagFilterSpec};
///
/// let f = TagFilter::compile(&TagFilterSpec::new("host", "=~", "web-\\d+")).unwrap();
/// let mut tags = HashMap::new();
/// tags.insert("host".to_string(), "web-01".to_string());
/// assert!(f.matches(&tags));
/// tags.insert("host".to_string(), "xweb-01".to_string());
/// assert!(!f.matches(&tags));
/// ```
#[derive(Debug, Clone)]
pub struct TagFilter {
    key: String,
    op: FilterOp,
}

impl TagFilter {
    pub fn compile(spec: &TagFilterSpec) -> Result<Self> {
        if spec.key.is_empty() {
            return Err(AlertError::Configuration(
                "tag filter with empty key".to_string(),
            ));
        }
        let op = match spec.op.trim() {
            "=" | "==" => FilterOp::Eq(spec.value.clone()),
            "!=" => FilterOp::NotEq(spec.value.clone()),
            "=~" => FilterOp::Match(anchored(&spec.value)?),
            "!~" => FilterOp::NotMatch(anchored(&spec.value)?),
            "in" => FilterOp::In(value_set(&spec.value)),
            "not in" => FilterOp::NotIn(value_set(&spec.value)),
            other => {
                return Err(AlertError::Configuration(format!(
                    "unknown tag filter operator '{other}' for key '{}'",
                    spec.key
                )))
            }
        };
        Ok(Self {
            key: spec.key.clone(),
            op,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn matches(&self, tags: &HashMap<String, String>) -> bool {
        let Some(value) = tags.get(&self.key) else {
            return matches!(
                self.op,
                FilterOp::NotEq(_) | FilterOp::NotMatch(_) | FilterOp::NotIn(_)
            );
        };
        match &self.op {
            FilterOp::Eq(v) => value == v,
            FilterOp::NotEq(v) => value != v,
            FilterOp::Match(re) => re.is_match(value),
            FilterOp::NotMatch(re) => !re.is_match(value),
            FilterOp::In(set) => set.contains(value),
            FilterOp::NotIn(set) => !set.contains(value),
        }
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{pattern})$"))?)
}

fn value_set(values: &str) -> HashSet<String> {
    values.split_whitespace().map(str::to_string).collect()
}

pub fn compile_all(specs: &[TagFilterSpec]) -> Result<Vec<TagFilter>> {
    specs.iter().map(TagFilter::compile).collect()
}

/// AND across filters; an empty list matches everything.
pub fn matches_all(filters: &[TagFilter], tags: &HashMap<String, String>) -> bool {
    filters.iter().all(|f| f.matches(tags))
}
