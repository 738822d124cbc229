use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vmjobs_core::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Partial => "partial",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulator threaded through one run's steps.
///
/// `data` is the job type's typed working set. Anything a step wants in the
/// result document goes through [`WorkflowState::record`]; recorded outputs
/// can be overwritten but never removed, so a failed run still reports
/// everything computed before the failure.
pub struct WorkflowState<S> {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub message: Option<String>,
    pub error: Option<JobError>,
    pub data: S,
    outputs: Map<String, Value>,
}

impl<S: Default> WorkflowState<S> {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            message: None,
            error: None,
            data: S::default(),
            outputs: Map::new(),
        }
    }
}

impl<S> WorkflowState<S> {
    pub fn record(&mut self, key: &str, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.outputs.insert(key.to_string(), value);
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    pub(crate) fn take_outputs(&mut self) -> Map<String, Value> {
        std::mem::take(&mut self.outputs)
    }

    pub fn execution_time_seconds(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_overwrites_but_keeps_keys() {
        let mut state: WorkflowState<()> = WorkflowState::new("job");
        state.record("weekdays", vec!["2024-01-08"]);
        state.record("count", 1);
        state.record("count", 2);
        assert_eq!(state.outputs().len(), 2);
        assert_eq!(state.output("count"), Some(&Value::from(2)));
        assert_eq!(state.status, RunStatus::Running);
    }
}
