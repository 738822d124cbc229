use thiserror::Error;
use vmjobs_core::JobError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule for job {id}: {message}")]
    InvalidSchedule { id: String, message: String },

    #[error("Duplicate job id: {id}")]
    DuplicateJob { id: String },

    /// No job with the given ID exists in the registry.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Job {id} is already running in this process")]
    AlreadyRunning { id: String },

    #[error("Registry is shut down")]
    ShutDown,

    #[error("Lock store error: {0}")]
    Lock(#[from] vmjobs_lock::LockError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl From<SchedulerError> for JobError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Lock(e) => e.into(),
            SchedulerError::AlreadyRunning { id } => JobError::LockContention { job_id: id },
            other => JobError::Configuration(other.to_string()),
        }
    }
}
