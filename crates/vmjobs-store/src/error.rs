use thiserror::Error;
use vmjobs_core::JobError;
use vmjobs_tsdb::TsdbError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Tsdb(#[from] TsdbError),

    /// A normal advance may not move a watermark backwards; use backfill.
    #[error("Watermark for {stream} is {current}, refusing to move back to {requested}")]
    WatermarkBackward {
        stream: String,
        current: String,
        requested: String,
    },

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Tsdb(e) => e.into(),
            StoreError::WatermarkBackward { .. } => JobError::DataValidation(e.to_string()),
            other => JobError::Persistence(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
