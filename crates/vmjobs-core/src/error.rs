use thiserror::Error;

/// Failure classes a job run can end in.
///
/// Every crate keeps its own error enum; at the step boundary those are mapped
/// onto one of these so result documents carry a stable [`JobError::code`].
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Invalid or missing configuration. The run does not start.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Another session holds the job's advisory lock. The tick is skipped.
    #[error("Job {job_id} is already running elsewhere")]
    LockContention { job_id: String },

    /// Network failure that survived the bounded retry budget.
    #[error("Network error after {attempts} attempt(s): {message}")]
    TransientNetwork { attempts: u32, message: String },

    /// Upstream data failed validation. Only the affected unit fails; never retried.
    #[error("Data validation error: {0}")]
    DataValidation(String),

    /// Relational store failure. The current transaction was rolled back.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A step panicked or otherwise failed outside its own error channel.
    #[error("Unexpected fault: {0}")]
    UnexpectedFault(String),
}

impl JobError {
    /// Short error code written into result documents.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Configuration(_) => "CONFIG_ERROR",
            JobError::LockContention { .. } => "LOCK_CONTENTION",
            JobError::TransientNetwork { .. } => "NETWORK_ERROR",
            JobError::DataValidation(_) => "DATA_VALIDATION_ERROR",
            JobError::Persistence(_) => "PERSISTENCE_ERROR",
            JobError::UnexpectedFault(_) => "UNEXPECTED_FAULT",
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(JobError::Configuration("x".into()).code(), "CONFIG_ERROR");
        assert_eq!(
            JobError::LockContention { job_id: "a".into() }.code(),
            "LOCK_CONTENTION"
        );
        assert_eq!(JobError::UnexpectedFault("boom".into()).code(), "UNEXPECTED_FAULT");
    }

    #[test]
    fn network_error_mentions_attempts() {
        let e = JobError::TransientNetwork {
            attempts: 3,
            message: "connection refused".into(),
        };
        assert_eq!(e.to_string(), "Network error after 3 attempt(s): connection refused");
    }
}
