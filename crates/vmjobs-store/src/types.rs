use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;

/// One data point ready to be written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedRecord {
    pub business_date: NaiveDate,
    /// Value of the job's key label, e.g. `auid`.
    pub record_key: String,
    pub metric_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    /// Remaining labels after the standard ones are removed.
    pub labels: BTreeMap<String, String>,
}

/// Everything written atomically for one `(job_id, business_date, execution_timestamp)`.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub job_id: String,
    pub business_date: NaiveDate,
    pub execution_timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub records: Vec<ExtractedRecord>,
    /// Records dropped before the write, e.g. for a missing key label.
    pub records_failed: u64,
}

impl UnitOfWork {
    pub fn new(job_id: &str, business_date: NaiveDate, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            business_date,
            execution_timestamp: Utc::now(),
            started_at,
            records: Vec::new(),
            records_failed: 0,
        }
    }
}

/// Statistics of a committed unit, derived from the in-memory batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UnitStats {
    pub records_processed: u64,
    pub records_failed: u64,
    pub max_data_timestamp: Option<DateTime<Utc>>,
    pub execution_time_seconds: f64,
}

/// A row of the run-tracking table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRunRecord {
    pub job_id: String,
    pub business_date: NaiveDate,
    pub execution_timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub records_processed: u64,
    pub records_failed: u64,
    pub execution_time_seconds: f64,
    pub max_data_timestamp: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn date_to_sql(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub(crate) fn date_from_sql(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}
