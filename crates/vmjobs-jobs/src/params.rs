use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use vmjobs_core::{JobDefinition, JobError};
use vmjobs_tsdb::Selector;

/// Deserializes a job's `params` table, reporting problems as configuration
/// errors.
pub fn parse<P: DeserializeOwned>(def: &JobDefinition) -> Result<P, JobError> {
    serde_json::from_value(def.params.clone())
        .map_err(|e| JobError::Configuration(format!("job {}: invalid params: {e}", def.id)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractorParams {
    #[serde(default = "default_cutoff_hour")]
    pub cutoff_hour: u32,
    #[serde(default = "default_extractor_offset")]
    pub start_date_offset_days: u32,
    #[serde(default = "default_chunk_size_days")]
    pub chunk_size_days: u32,
    #[serde(default)]
    pub sliding_window_days: usize,
    /// Label identifying the entity a record belongs to.
    #[serde(default = "default_key_label")]
    pub key_label: String,
    /// Extra label matchers added to every source query.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    /// Evaluate queries at this step instead of returning raw samples.
    #[serde(default)]
    pub query_step_secs: Option<u64>,
}

impl ExtractorParams {
    pub fn validate(&self) -> Result<(), JobError> {
        check_cutoff(self.cutoff_hour)?;
        if self.chunk_size_days == 0 {
            return Err(JobError::Configuration("chunk_size_days must be at least 1".into()));
        }
        if self.key_label.is_empty() {
            return Err(JobError::Configuration("key_label must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorParams {
    pub source_url: String,
    #[serde(default)]
    pub source_token: Option<String>,
    /// Value of the `source` label on everything this job pushes.
    #[serde(default = "default_source_name")]
    pub source_name: String,
    /// Prefix for pushed gauges: `<metric_name>_<field>`.
    #[serde(default = "default_metric_name")]
    pub metric_name: String,
    #[serde(default = "default_watermark_metric")]
    pub watermark_metric: String,
    #[serde(default = "default_watermark_lookback_days")]
    pub watermark_lookback_days: u64,
    #[serde(default = "default_cutoff_hour")]
    pub cutoff_hour: u32,
    #[serde(default = "default_data_lag")]
    pub data_lag_business_days: u32,
    #[serde(default = "default_collector_offset")]
    pub start_date_offset_days: u32,
    #[serde(default)]
    pub backfill_start_date: Option<NaiveDate>,
    #[serde(default = "default_max_days_per_run")]
    pub max_days_per_run: usize,
    #[serde(default)]
    pub sliding_window_days: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl CollectorParams {
    pub fn validate(&self) -> Result<(), JobError> {
        check_cutoff(self.cutoff_hour)?;
        if self.source_url.trim().is_empty() {
            return Err(JobError::Configuration("source_url is required".into()));
        }
        if self.max_days_per_run == 0 {
            return Err(JobError::Configuration("max_days_per_run must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConverterParams {
    /// Values of the `job` label whose `biz_date` series get converted.
    pub jobs: Vec<String>,
    #[serde(default = "default_cutoff_hour")]
    pub cutoff_hour: u32,
    #[serde(default = "default_converter_lookback_days")]
    pub watermark_lookback_days: u64,
    /// How far before the source watermark each query starts.
    #[serde(default = "default_source_overlap_secs")]
    pub source_overlap_secs: u64,
    /// Query window when a job has no source watermark yet.
    #[serde(default = "default_initial_lookback_days")]
    pub source_initial_lookback_days: u64,
}

impl ConverterParams {
    pub fn validate(&self) -> Result<(), JobError> {
        check_cutoff(self.cutoff_hour)?;
        if self.jobs.is_empty() || self.jobs.iter().any(|j| j.trim().is_empty()) {
            return Err(JobError::Configuration(
                "jobs must list at least one non-empty job name".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsExtractParams {
    /// Series selectors, e.g. `balance{desk="rates"}`. Each one resumes from
    /// its own last extracted timestamp.
    pub metric_selectors: Vec<String>,
    #[serde(default = "default_cutoff_hour")]
    pub cutoff_hour: u32,
    /// Query window when a selector has never been extracted.
    #[serde(default = "default_initial_lookback_days")]
    pub initial_lookback_days: u64,
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,
}

impl MetricsExtractParams {
    pub fn validate(&self) -> Result<(), JobError> {
        check_cutoff(self.cutoff_hour)?;
        if self.metric_selectors.is_empty() {
            return Err(JobError::Configuration("metric_selectors must not be empty".into()));
        }
        for expr in &self.metric_selectors {
            Selector::parse(expr).map_err(|e| JobError::Configuration(e.to_string()))?;
        }
        if self.step_secs == 0 {
            return Err(JobError::Configuration("step_secs must be at least 1".into()));
        }
        Ok(())
    }
}

fn check_cutoff(hour: u32) -> Result<(), JobError> {
    if hour > 23 {
        return Err(JobError::Configuration(format!(
            "cutoff_hour must be 0-23, got {hour}"
        )));
    }
    Ok(())
}

fn default_cutoff_hour() -> u32 {
    6
}
fn default_extractor_offset() -> u32 {
    30
}
fn default_collector_offset() -> u32 {
    20
}
fn default_chunk_size_days() -> u32 {
    1
}
fn default_key_label() -> String {
    "auid".to_string()
}
fn default_source_name() -> String {
    "apex".to_string()
}
fn default_metric_name() -> String {
    "apex_data".to_string()
}
fn default_watermark_metric() -> String {
    "collector_watermark_days".to_string()
}
fn default_watermark_lookback_days() -> u64 {
    90
}
fn default_data_lag() -> u32 {
    1
}
fn default_max_days_per_run() -> usize {
    5
}
fn default_converter_lookback_days() -> u64 {
    30
}
fn default_source_overlap_secs() -> u64 {
    600
}
fn default_initial_lookback_days() -> u64 {
    30
}
fn default_step_secs() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vmjobs_core::{JobKind, Schedule};

    fn def(params: serde_json::Value) -> JobDefinition {
        JobDefinition {
            id: "j".into(),
            name: None,
            description: String::new(),
            enabled: true,
            kind: JobKind::Collector,
            schedule: Schedule::Interval { every_secs: 60 },
            params,
        }
    }

    #[test]
    fn extractor_defaults() {
        let p: ExtractorParams = parse(&def(json!({}))).unwrap();
        assert_eq!(p.cutoff_hour, 6);
        assert_eq!(p.start_date_offset_days, 30);
        assert_eq!(p.key_label, "auid");
        p.validate().unwrap();
    }

    #[test]
    fn collector_requires_source_url() {
        let err = parse::<CollectorParams>(&def(json!({}))).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");

        let p: CollectorParams = parse(&def(json!({
            "source_url": "http://apex/api",
            "backfill_start_date": "2024-01-02",
        })))
        .unwrap();
        assert_eq!(p.max_days_per_run, 5);
        assert_eq!(p.backfill_start_date, NaiveDate::from_ymd_opt(2024, 1, 2));
        p.validate().unwrap();
    }

    #[test]
    fn converter_needs_jobs() {
        let p: ConverterParams = parse(&def(json!({ "jobs": ["ext_a"] }))).unwrap();
        assert_eq!(p.source_overlap_secs, 600);
        assert_eq!(p.watermark_lookback_days, 30);
        p.validate().unwrap();

        let p: ConverterParams = parse(&def(json!({ "jobs": [] }))).unwrap();
        assert_eq!(p.validate().unwrap_err().code(), "CONFIG_ERROR");
    }

    #[test]
    fn metrics_extract_checks_selectors() {
        let p: MetricsExtractParams =
            parse(&def(json!({ "metric_selectors": ["balance{desk=\"rates\"}"] }))).unwrap();
        assert_eq!(p.step_secs, 3600);
        p.validate().unwrap();

        let p: MetricsExtractParams =
            parse(&def(json!({ "metric_selectors": ["sum(rate(x[5m]))"] }))).unwrap();
        assert_eq!(p.validate().unwrap_err().code(), "CONFIG_ERROR");
    }

    #[test]
    fn typos_are_rejected() {
        let err = parse::<ExtractorParams>(&def(json!({ "cuttoff_hour": 5 }))).unwrap_err();
        assert!(err.to_string().contains("cuttoff_hour"));
        let p: ExtractorParams = parse(&def(json!({ "cutoff_hour": 24 }))).unwrap();
        assert!(p.validate().is_err());
    }
}
