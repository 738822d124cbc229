use thiserror::Error;
use vmjobs_core::JobError;

use crate::retry::Transient;

#[derive(Debug, Error)]
pub enum TsdbError {
    /// Connect failure, timeout or 5xx. Retried.
    #[error("Time-series store unavailable after {attempts} attempt(s): {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("Time-series store returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Unparseable time-series response: {0}")]
    Parse(String),

    #[error("Time-series store not configured: {0}")]
    NotConfigured(&'static str),
}

impl TsdbError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            TsdbError::Unavailable {
                attempts: 1,
                message: e.to_string(),
            }
        } else if e.is_decode() {
            TsdbError::Parse(e.to_string())
        } else {
            TsdbError::Api {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

impl Transient for TsdbError {
    fn is_transient(&self) -> bool {
        matches!(self, TsdbError::Unavailable { .. })
    }

    fn with_attempts(self, attempts: u32) -> Self {
        match self {
            TsdbError::Unavailable { message, .. } => TsdbError::Unavailable { attempts, message },
            other => other,
        }
    }
}

impl From<TsdbError> for JobError {
    fn from(e: TsdbError) -> Self {
        match e {
            TsdbError::Unavailable { attempts, message } => {
                JobError::TransientNetwork { attempts, message }
            }
            TsdbError::Api { status, message } => JobError::TransientNetwork {
                attempts: 1,
                message: format!("HTTP {status}: {message}"),
            },
            TsdbError::Parse(msg) => JobError::DataValidation(msg),
            TsdbError::NotConfigured(what) => JobError::Configuration(what.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TsdbError>;
