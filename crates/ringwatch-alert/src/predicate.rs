use crate::error::AlertError;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Equal,
    NotEqual,
}

impl FromStr for CompareOp {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" | "gt" | "greater_than" => Ok(Self::GreaterThan),
            "<" | "lt" | "less_than" => Ok(Self::LessThan),
            ">=" | "gte" | "greater_equal" => Ok(Self::GreaterEqual),
            "<=" | "lte" | "less_equal" => Ok(Self::LessEqual),
            "==" | "=" | "eq" => Ok(Self::Equal),
            "!=" | "ne" => Ok(Self::NotEqual),
            _ => Err(AlertError::Configuration(format!(
                "unknown compare operator: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GreaterThan => write!(f, ">"),
            Self::LessThan => write!(f, "<"),
            Self::GreaterEqual => write!(f, ">="),
            Self::LessEqual => write!(f, "<="),
            Self::Equal => write!(f, "=="),
            Self::NotEqual => write!(f, "!="),
        }
    }
}

impl CompareOp {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::LessThan => value < threshold,
            Self::GreaterEqual => value >= threshold,
            Self::LessEqual => value <= threshold,
            Self::Equal => value == threshold,
            Self::NotEqual => value != threshold,
        }
    }
}

/// How the samples of a slice are folded before the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// Every sample satisfies the comparison.
    All,
    /// At least one sample satisfies the comparison.
    Any,
    Avg,
    Max,
    Min,
    Count,
    Sum,
}

impl FromStr for Aggregate {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            "avg" => Ok(Self::Avg),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            _ => Err(AlertError::Configuration(format!("unknown aggregate: {s}"))),
        }
    }
}

impl std::fmt::Display for Aggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::All => "all",
            Self::Any => "any",
            Self::Avg => "avg",
            Self::Max => "max",
            Self::Min => "min",
            Self::Count => "count",
            Self::Sum => "sum",
        };
        f.write_str(name)
    }
}

/// Outcome of one predicate evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub breach: bool,
    /// Value reported as the trigger value: the aggregate for folding
    /// aggregates, the latest sample for `all`/`any`.
    pub value: f64,
    /// Timestamp of the latest sample considered.
    pub ts: i64,
}

/// `aggregate(slice) OP threshold`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Predicate {
    pub aggregate: Aggregate,
    pub op: CompareOp,
    pub threshold: f64,
}

impl Predicate {
    /// Evaluates the slice `[latest_ts - for_duration, latest_ts]` of
    /// `samples` (ascending by ts). With `for_duration = 0` only the latest
    /// sample is considered. Returns `None` for an empty input.
    ///
    /// # Examples
    ///
    /// ```
    /// use ringwatch_alert::predicate::{Aggregate, CompareOp, Predicate};
    ///
    /// let p = Predicate { aggregate: Aggregate::All, op: CompareOp::GreaterThan, threshold: 80.0 };
    /// let samples = [(0, 70.0), (60, 85.0), (120, 86.0)];
    /// assert!(!p.evaluate(&samples, 120).unwrap().breach);
    /// assert!(p.evaluate(&samples, 60).unwrap().breach);
    /// ```
    pub fn evaluate(&self, samples: &[(i64, f64)], for_duration: i64) -> Option<Verdict> {
        let &(latest_ts, latest_value) = samples.last()?;
        let since = latest_ts - for_duration.max(0);
        let start = samples.partition_point(|(ts, _)| *ts < since);
        let slice = &samples[start..];
        let values = slice.iter().map(|(_, v)| *v);

        let (breach, value) = match self.aggregate {
            Aggregate::All => (
                slice.iter().all(|(_, v)| self.op.check(*v, self.threshold)),
                latest_value,
            ),
            Aggregate::Any => (
                slice.iter().any(|(_, v)| self.op.check(*v, self.threshold)),
                latest_value,
            ),
            Aggregate::Avg => {
                let avg = values.sum::<f64>() / slice.len() as f64;
                (self.op.check(avg, self.threshold), avg)
            }
            Aggregate::Max => {
                let max = values.fold(f64::NEG_INFINITY, f64::max);
                (self.op.check(max, self.threshold), max)
            }
            Aggregate::Min => {
                let min = values.fold(f64::INFINITY, f64::min);
                (self.op.check(min, self.threshold), min)
            }
            Aggregate::Count => {
                let count = slice.len() as f64;
                (self.op.check(count, self.threshold), count)
            }
            Aggregate::Sum => {
                let sum = values.sum::<f64>();
                (self.op.check(sum, self.threshold), sum)
            }
        };
        Some(Verdict {
            breach,
            value,
            ts: latest_ts,
        })
    }
}
