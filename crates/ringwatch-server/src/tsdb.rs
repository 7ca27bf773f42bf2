use async_trait::async_trait;
use ringwatch_alert::error::{AlertError, Result};
use ringwatch_alert::{QuerySeries, TsdbClient};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Resolution requested from the backend for each range query.
const QUERY_STEP_SECS: i64 = 15;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<MatrixSeries>,
}

#[derive(Debug, Deserialize)]
struct MatrixSeries {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Client of a Prometheus-compatible `query_range` API.
pub struct PromTsdb {
    base_url: String,
    client: reqwest::Client,
}

impl PromTsdb {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

/// Decodes a `query_range` body into series with finite samples.
pub fn parse_matrix(body: &str) -> Result<Vec<QuerySeries>> {
    let resp: QueryResponse =
        serde_json::from_str(body).map_err(|e| AlertError::Tsdb(format!("undecodable response: {e}")))?;
    if resp.status != "success" {
        return Err(AlertError::Tsdb(
            resp.error.unwrap_or_else(|| format!("status {}", resp.status)),
        ));
    }
    let Some(data) = resp.data else {
        return Ok(Vec::new());
    };
    if data.result_type != "matrix" {
        return Err(AlertError::Tsdb(format!(
            "expected a matrix result, got {}",
            data.result_type
        )));
    }

    Ok(data
        .result
        .into_iter()
        .map(|series| QuerySeries {
            labels: series.metric,
            samples: series
                .values
                .into_iter()
                .filter_map(|(ts, v)| {
                    let v: f64 = v.parse().ok()?;
                    v.is_finite().then_some((ts as i64, v))
                })
                .collect(),
        })
        .collect())
}

#[async_trait]
impl TsdbClient for PromTsdb {
    async fn range_query(&self, expr: &str, now: i64, lookback_secs: i64) -> Result<Vec<QuerySeries>> {
        let start = now - lookback_secs.max(QUERY_STEP_SECS);
        let url = format!("{}/api/v1/query_range", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("query", expr.to_string()),
                ("start", start.to_string()),
                ("end", now.to_string()),
                ("step", QUERY_STEP_SECS.to_string()),
            ])
            .send()
            .await
            .map_err(|e| AlertError::Tsdb(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AlertError::Tsdb(e.to_string()))?;
        // Prometheus reports query errors with 4xx and a JSON body.
        if status.is_server_error() {
            return Err(AlertError::Tsdb(format!("HTTP {status}")));
        }
        parse_matrix(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_is_decoded_and_non_finite_samples_skipped() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {"metric": {"ident": "h1", "mount": "/"},
                     "values": [[1700000000, "91.5"], [1700000015, "NaN"], [1700000030.5, "93"]]}
                ]
            }
        }"#;
        let series = parse_matrix(body).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels.get("mount").map(String::as_str), Some("/"));
        assert_eq!(series[0].samples, vec![(1_700_000_000, 91.5), (1_700_000_030, 93.0)]);
    }

    #[test]
    fn error_status_becomes_tsdb_error() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error at char 3"}"#;
        match parse_matrix(body) {
            Err(AlertError::Tsdb(msg)) => assert!(msg.contains("parse error")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn vector_result_is_rejected() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert!(parse_matrix(body).is_err());
    }
}
