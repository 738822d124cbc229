use thiserror::Error;
use vmjobs_core::JobError;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock store connection failed: {0}")]
    Connect(String),

    #[error("Lock store query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for LockError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                LockError::Connect(e.to_string())
            }
            other => LockError::Query(other.to_string()),
        }
    }
}

impl From<LockError> for JobError {
    fn from(e: LockError) -> Self {
        JobError::Persistence(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
