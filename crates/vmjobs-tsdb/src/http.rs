use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};
use vmjobs_core::config::VictoriaMetricsConfig;

use crate::error::{Result, TsdbError};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::TimeSeriesStore;
use crate::types::{GaugeSample, Sample, Selector, Series};

/// VictoriaMetrics over its Prometheus-compatible HTTP API.
pub struct VictoriaMetricsClient {
    client: reqwest::Client,
    query_url: String,
    gateway_url: String,
    token: Option<String>,
    retry: RetryPolicy,
}

impl VictoriaMetricsClient {
    pub fn new(config: &VictoriaMetricsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TsdbError::Api {
                status: 0,
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            query_url: config.query_url.trim_end_matches('/').to_string(),
            gateway_url: config.gateway_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
            retry: RetryPolicy::with_attempts(config.max_retries),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_query(&self, path: &str, params: &[(&str, String)]) -> Result<PromData> {
        if self.query_url.is_empty() {
            return Err(TsdbError::NotConfigured("victoria_metrics.query_url"));
        }
        let url = format!("{}{}", self.query_url, path);
        let url = url.as_str();

        with_backoff(path, &self.retry, |attempt| {
            let req = self.authorize(self.client.get(url).query(params));
            async move {
                debug!(%url, attempt, "querying time-series store");
                let resp = req.send().await.map_err(TsdbError::from_reqwest)?;
                let status = resp.status();
                if status.is_server_error() {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(TsdbError::Unavailable {
                        attempts: attempt,
                        message: format!("HTTP {}: {text}", status.as_u16()),
                    });
                }
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    warn!(status = status.as_u16(), body = %text, "time-series query rejected");
                    return Err(TsdbError::Api {
                        status: status.as_u16(),
                        message: text,
                    });
                }
                let body: PromResponse = resp.json().await.map_err(TsdbError::from_reqwest)?;
                body.into_data()
            }
        })
        .await
    }
}

#[async_trait]
impl TimeSeriesStore for VictoriaMetricsClient {
    async fn query_range(
        &self,
        selector: &Selector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Option<Duration>,
    ) -> Result<Vec<Series>> {
        let data = match step {
            Some(step) => {
                let params = [
                    ("query", selector.to_promql()),
                    ("start", start.timestamp().to_string()),
                    ("end", end.timestamp().to_string()),
                    ("step", format!("{}s", step.as_secs().max(1))),
                ];
                self.get_query("/api/v1/query_range", &params).await?
            }
            None => {
                // A range selector evaluated at `end` returns raw samples.
                let window = (end - start).num_seconds().max(1);
                let params = [
                    ("query", format!("{}[{window}s]", selector.to_promql())),
                    ("time", end.timestamp().to_string()),
                ];
                self.get_query("/api/v1/query", &params).await?
            }
        };
        let series = data.into_series()?;
        Ok(series
            .into_iter()
            .map(|mut s| {
                s.samples.retain(|p| p.timestamp >= start && p.timestamp <= end);
                s
            })
            .collect())
    }

    async fn query_instant(&self, selector: &Selector) -> Result<Option<f64>> {
        let query = match selector.lookback {
            Some(lookback) => format!(
                "last_over_time({}[{}s])",
                selector.to_promql(),
                lookback.as_secs().max(1)
            ),
            None => selector.to_promql(),
        };
        let data = self.get_query("/api/v1/query", &[("query", query)]).await?;
        let latest = data
            .into_series()?
            .iter()
            .filter_map(Series::latest)
            .max_by_key(|s| s.timestamp)
            .map(|s| s.value);
        Ok(latest)
    }

    async fn push(&self, samples: &[GaugeSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        if self.gateway_url.is_empty() {
            return Err(TsdbError::NotConfigured("victoria_metrics.gateway_url"));
        }
        let url = format!("{}/api/v1/import/prometheus", self.gateway_url);
        let body: String = samples
            .iter()
            .map(|s| s.to_line() + "\n")
            .collect();

        with_backoff("import/prometheus", &self.retry, |attempt| {
            let req = self.authorize(
                self.client
                    .post(&url)
                    .header("content-type", "text/plain")
                    .body(body.clone()),
            );
            async move {
                let resp = req.send().await.map_err(TsdbError::from_reqwest)?;
                let status = resp.status();
                if status.is_success() {
                    return Ok(());
                }
                let text = resp.text().await.unwrap_or_default();
                if status.is_server_error() {
                    Err(TsdbError::Unavailable {
                        attempts: attempt,
                        message: format!("HTTP {}: {text}", status.as_u16()),
                    })
                } else {
                    Err(TsdbError::Api {
                        status: status.as_u16(),
                        message: text,
                    })
                }
            }
        })
        .await?;
        debug!(count = samples.len(), "pushed gauge samples");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PromResponse {
    status: String,
    data: Option<PromData>,
    error: Option<String>,
}

impl PromResponse {
    fn into_data(self) -> Result<PromData> {
        if self.status != "success" {
            return Err(TsdbError::Api {
                status: 422,
                message: self.error.unwrap_or(self.status),
            });
        }
        self.data
            .ok_or_else(|| TsdbError::Parse("missing data field".to_string()))
    }
}

#[derive(Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<PromSeries>,
}

#[derive(Deserialize)]
struct PromSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    values: Option<Vec<(f64, String)>>,
    value: Option<(f64, String)>,
}

impl PromData {
    fn into_series(self) -> Result<Vec<Series>> {
        self.result
            .into_iter()
            .map(|s| {
                let points = match (s.values, s.value) {
                    (Some(values), _) => values,
                    (None, Some(value)) => vec![value],
                    (None, None) => Vec::new(),
                };
                let samples = points
                    .into_iter()
                    .map(|(ts, v)| parse_point(ts, &v))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Series {
                    labels: s.metric,
                    samples,
                })
            })
            .collect()
    }
}

fn parse_point(ts: f64, value: &str) -> Result<Sample> {
    let millis = (ts * 1000.0).round() as i64;
    let timestamp = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| TsdbError::Parse(format!("bad timestamp {ts}")))?;
    let value = value
        .parse::<f64>()
        .map_err(|_| TsdbError::Parse(format!("bad sample value {value:?}")))?;
    Ok(Sample { timestamp, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_matrix_and_vector() {
        let matrix: PromResponse = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"matrix","result":[
                {"metric":{"__name__":"cpu","auid":"A1"},"values":[[1705276800,"1.5"],[1705280400.5,"2"]]}
            ]}}"#,
        )
        .unwrap();
        let series = matrix.into_data().unwrap().into_series().unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name(), Some("cpu"));
        assert_eq!(series[0].samples.len(), 2);
        assert_eq!(series[0].latest().unwrap().value, 2.0);
        assert_eq!(series[0].samples[1].timestamp.timestamp_millis(), 1_705_280_400_500);

        let vector: PromResponse = serde_json::from_str(
            r#"{"status":"success","data":{"resultType":"vector","result":[
                {"metric":{},"value":[1705276800,"1705190400"]}
            ]}}"#,
        )
        .unwrap();
        let series = vector.into_data().unwrap().into_series().unwrap();
        assert_eq!(series[0].samples[0].value, 1_705_190_400.0);
    }

    #[test]
    fn error_status_is_reported() {
        let resp: PromResponse =
            serde_json::from_str(r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#)
                .unwrap();
        let err = resp.into_data().err().unwrap();
        assert!(err.to_string().contains("parse error"));
    }

    #[test]
    fn bad_sample_value_is_parse_error() {
        assert!(matches!(parse_point(1.0, "abc"), Err(TsdbError::Parse(_))));
    }

    #[tokio::test]
    async fn unconfigured_urls_fail_fast() {
        let client = VictoriaMetricsClient::new(&VictoriaMetricsConfig::default()).unwrap();
        let err = client.query_instant(&Selector::metric("x")).await.unwrap_err();
        assert!(matches!(err, TsdbError::NotConfigured(_)));
        // Empty pushes never touch the network.
        client.push(&[]).await.unwrap();
    }
}
