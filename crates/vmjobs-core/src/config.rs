use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};
use crate::types::JobDefinition;

pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_HTTP_PORT: u16 = 8000;
pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1";
pub const DEFAULT_TSDB_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TSDB_MAX_RETRIES: u32 = 3;

/// Top-level config (vmjobs.toml + VMJOBS_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmJobsConfig {
    /// Size of the worker pool runs are dispatched onto.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// How long shutdown waits for in-flight runs before aborting them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Value of the `env` label on every pushed gauge.
    #[serde(default = "default_env")]
    pub env: String,
    /// Extra labels on every pushed gauge.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub victoria_metrics: VictoriaMetricsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl Default for VmJobsConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            env: default_env(),
            labels: BTreeMap::new(),
            database: DatabaseConfig::default(),
            lock: LockConfig::default(),
            victoria_metrics: VictoriaMetricsConfig::default(),
            http: HttpConfig::default(),
            redaction: RedactionConfig::default(),
            jobs: Vec::new(),
        }
    }
}

/// Relational store holding run records and extracted data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Shared store used for cross-process advisory locks.
///
/// When `url` is unset the scheduler runs without cross-process locking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockConfig {
    /// PostgreSQL connection URL, e.g. `postgres://scheduler@db/scheduler`.
    pub url: Option<String>,
    #[serde(default = "default_lock_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Upper bound on concurrently held locks (one connection per held lock).
    #[serde(default = "default_lock_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VictoriaMetricsConfig {
    /// Base URL for `/api/v1/query` and `/api/v1/query_range`.
    #[serde(default)]
    pub query_url: String,
    /// Base URL for `/api/v1/import/prometheus`. Empty disables pushes.
    #[serde(default)]
    pub gateway_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_tsdb_timeout")]
    pub timeout_secs: u64,
    /// Attempts per call for transient failures (connect, timeout, 5xx).
    #[serde(default = "default_tsdb_retries")]
    pub max_retries: u32,
}

impl Default for VictoriaMetricsConfig {
    fn default() -> Self {
        Self {
            query_url: String::new(),
            gateway_url: String::new(),
            token: None,
            timeout_secs: DEFAULT_TSDB_TIMEOUT_SECS,
            max_retries: DEFAULT_TSDB_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_http_bind")]
    pub bind: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_http_bind(),
            port: default_http_port(),
        }
    }
}

/// Extra key patterns masked in result documents on top of the built-in list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedactionConfig {
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

fn bool_true() -> bool {
    true
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_env() -> String {
    "default".to_string()
}
fn default_lock_connect_timeout() -> u64 {
    10
}
fn default_lock_max_connections() -> u32 {
    16
}
fn default_tsdb_timeout() -> u64 {
    DEFAULT_TSDB_TIMEOUT_SECS
}
fn default_tsdb_retries() -> u32 {
    DEFAULT_TSDB_MAX_RETRIES
}
fn default_http_bind() -> String {
    DEFAULT_HTTP_BIND.to_string()
}
fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.vmjobs/vmjobs.db", home)
}

impl VmJobsConfig {
    /// Load config from a TOML file with VMJOBS_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `VMJOBS_VICTORIA_METRICS__TOKEN` overrides `victoria_metrics.token`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("VMJOBS_").split("__")),
        )
    }

    /// Parse config from an in-memory TOML document (no env overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: VmJobsConfig = figment
            .extract()
            .map_err(|e| JobError::Configuration(e.to_string()))?;
        if config.max_workers == 0 {
            return Err(JobError::Configuration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.vmjobs/vmjobs.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobKind, Schedule};

    #[test]
    fn parses_jobs_and_sections() {
        let cfg = VmJobsConfig::from_toml_str(
            r#"
            max_workers = 4
            env = "prod"

            [lock]
            url = "postgres://scheduler@localhost/scheduler"

            [victoria_metrics]
            query_url = "http://vm:8428"
            gateway_url = "http://vm:8428"

            [[jobs]]
            id = "system_a_extractor"
            kind = "extractor"
            schedule = { type = "cron", expression = "0 */15 * * * *" }
            params = { cutoff_hour = 6, chunk_size_days = 1 }

            [[jobs]]
            id = "apex"
            kind = "collector"
            enabled = false
            schedule = { type = "interval", every_secs = 3600 }
            "#,
        )
        .unwrap();

        assert_eq!(cfg.max_workers, 4);
        assert_eq!(cfg.env, "prod");
        assert!(cfg.lock.url.is_some());
        assert_eq!(cfg.lock.max_connections, 16);
        assert_eq!(cfg.victoria_metrics.max_retries, DEFAULT_TSDB_MAX_RETRIES);
        assert_eq!(cfg.jobs.len(), 2);
        assert_eq!(cfg.jobs[0].kind, JobKind::Extractor);
        assert_eq!(cfg.jobs[0].params["cutoff_hour"], 6);
        assert!(!cfg.jobs[1].enabled);
        assert_eq!(cfg.jobs[1].schedule, Schedule::Interval { every_secs: 3600 });
    }

    #[test]
    fn missing_lock_url_means_no_locking() {
        let cfg = VmJobsConfig::from_toml_str("").unwrap();
        assert!(cfg.lock.url.is_none());
        assert_eq!(cfg.max_workers, DEFAULT_MAX_WORKERS);
        assert!(cfg.jobs.is_empty());
    }

    #[test]
    fn zero_workers_rejected() {
        let err = VmJobsConfig::from_toml_str("max_workers = 0").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
