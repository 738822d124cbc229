use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use vmjobs_core::JobError;
use vmjobs_tsdb::{with_backoff, RetryPolicy, Transient};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source unavailable after {attempts} attempt(s): {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("Source returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unparseable source payload: {0}")]
    Parse(String),
}

impl Transient for SourceError {
    fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable { .. })
    }

    fn with_attempts(self, attempts: u32) -> Self {
        match self {
            SourceError::Unavailable { message, .. } => SourceError::Unavailable { attempts, message },
            other => other,
        }
    }
}

impl From<SourceError> for JobError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Unavailable { attempts, message } => {
                JobError::TransientNetwork { attempts, message }
            }
            SourceError::Status { status, message } => JobError::TransientNetwork {
                attempts: 1,
                message: format!("HTTP {status}: {message}"),
            },
            SourceError::Parse(msg) => JobError::DataValidation(msg),
        }
    }
}

/// An upstream REST endpoint returning JSON.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        token: Option<&str>,
        params: &[(String, String)],
    ) -> Result<Value, SourceError>;
}

pub struct HttpSourceClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpSourceClient {
    pub fn new(timeout: Duration, max_attempts: u32) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Status {
                status: 0,
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            retry: RetryPolicy::with_attempts(max_attempts),
        })
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch(
        &self,
        url: &str,
        token: Option<&str>,
        params: &[(String, String)],
    ) -> Result<Value, SourceError> {
        with_backoff(url, &self.retry, |attempt| {
            let mut req = self
                .client
                .get(url)
                .header("content-type", "application/json")
                .query(params);
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            async move {
                debug!(url, attempt, "fetching from source");
                let resp = req.send().await.map_err(|e| {
                    if e.is_connect() || e.is_timeout() {
                        SourceError::Unavailable {
                            attempts: attempt,
                            message: e.to_string(),
                        }
                    } else {
                        SourceError::Status {
                            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                            message: e.to_string(),
                        }
                    }
                })?;
                let status = resp.status();
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(if status.is_server_error() {
                        SourceError::Unavailable {
                            attempts: attempt,
                            message: format!("HTTP {}: {text}", status.as_u16()),
                        }
                    } else {
                        SourceError::Status {
                            status: status.as_u16(),
                            message: text,
                        }
                    });
                }
                resp.json::<Value>()
                    .await
                    .map_err(|e| SourceError::Parse(e.to_string()))
            }
        })
        .await
    }
}

/// Canned responses keyed by the value of one query parameter.
pub struct MemorySource {
    key_param: String,
    responses: Mutex<HashMap<String, Result<Value, String>>>,
    calls: Mutex<Vec<Vec<(String, String)>>>,
}

impl MemorySource {
    pub fn new(key_param: impl Into<String>) -> Self {
        Self {
            key_param: key_param.into(),
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(&self, key: impl Into<String>, payload: Value) {
        self.responses.lock().unwrap().insert(key.into(), Ok(payload));
    }

    /// Makes requests for `key` fail as if the source were down.
    pub fn fail(&self, key: impl Into<String>, message: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .insert(key.into(), Err(message.into()));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SourceClient for MemorySource {
    async fn fetch(
        &self,
        _url: &str,
        _token: Option<&str>,
        params: &[(String, String)],
    ) -> Result<Value, SourceError> {
        self.calls.lock().unwrap().push(params.to_vec());
        let key = params
            .iter()
            .find(|(k, _)| *k == self.key_param)
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        match self.responses.lock().unwrap().get(&key) {
            Some(Ok(v)) => Ok(v.clone()),
            Some(Err(msg)) => Err(SourceError::Unavailable {
                attempts: 1,
                message: msg.clone(),
            }),
            None => Ok(Value::Array(Vec::new())),
        }
    }
}
