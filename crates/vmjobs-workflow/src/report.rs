use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::state::RunStatus;

/// The document every run produces, success or not.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub job_id: String,
    pub job_display_name: String,
    pub job_description: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: RunStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    pub execution_time_seconds: f64,
    /// Job params with sensitive values masked.
    pub job_config: Value,
    #[serde(flatten)]
    pub outputs: Map<String, Value>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn output_u64(&self, key: &str) -> Option<u64> {
        self.outputs.get(key).and_then(Value::as_u64)
    }
}
