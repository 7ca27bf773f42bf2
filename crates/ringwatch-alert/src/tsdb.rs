use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// One labelled series returned by a range query, samples ascending by ts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySeries {
    pub labels: HashMap<String, String>,
    pub samples: Vec<(i64, f64)>,
}

/// Time-series backend queried by range-query rules.
#[async_trait]
pub trait TsdbClient: Send + Sync {
    /// Runs `expr` over `[now - lookback_secs, now]`.
    async fn range_query(&self, expr: &str, now: i64, lookback_secs: i64) -> Result<Vec<QuerySeries>>;
}
