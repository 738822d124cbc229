use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use vmjobs_core::config::VmJobsConfig;
use vmjobs_core::redact::Redactor;
use vmjobs_core::JobDefinition;
use vmjobs_jobs::{HttpSourceClient, JobContext};
use vmjobs_lock::{LockManager, PgLockBackend};
use vmjobs_scheduler::{EngineSettings, JobRunner};
use vmjobs_tsdb::{TimeSeriesStore, VictoriaMetricsClient};
use vmjobs_workflow::{RunReport, WorkflowEngine};

/// Runs jobs through the workflow engine with the daemon's collaborators.
pub struct WorkflowRunner {
    engine: WorkflowEngine,
    ctx: JobContext,
}

impl WorkflowRunner {
    pub fn context(&self) -> &JobContext {
        &self.ctx
    }
}

#[async_trait]
impl JobRunner for WorkflowRunner {
    async fn run(&self, def: &JobDefinition) -> RunReport {
        vmjobs_jobs::run_job(&self.engine, &self.ctx, def).await
    }
}

/// Collaborators built from config.
pub struct App {
    pub config: VmJobsConfig,
    pub tsdb: Arc<dyn TimeSeriesStore>,
    pub runner: Arc<WorkflowRunner>,
    pub locks: LockManager,
}

impl App {
    pub async fn build(config: VmJobsConfig) -> anyhow::Result<Self> {
        let db_path = &config.database.path;
        info!(path = %db_path, "opening SQLite database");
        let db = Arc::new(Mutex::new(vmjobs_store::open(db_path)?));

        let tsdb: Arc<dyn TimeSeriesStore> =
            Arc::new(VictoriaMetricsClient::new(&config.victoria_metrics)?);
        let source = Arc::new(HttpSourceClient::new(
            Duration::from_secs(config.victoria_metrics.timeout_secs),
            config.victoria_metrics.max_retries,
        )?);
        let ctx = JobContext::new(Arc::clone(&tsdb), db, source, config.env.clone())
            .with_labels(config.labels.clone());
        let engine = WorkflowEngine::new(Redactor::new(&config.redaction.extra_patterns));

        let locks = match &config.lock.url {
            Some(url) => {
                let backend = PgLockBackend::connect(
                    url,
                    config.lock.max_connections,
                    Duration::from_secs(config.lock.connect_timeout_secs),
                )
                .await?;
                info!("Advisory lock store connected");
                LockManager::new(Arc::new(backend))
            }
            None => LockManager::unlocked(),
        };

        Ok(Self {
            tsdb,
            runner: Arc::new(WorkflowRunner { engine, ctx }),
            locks,
            config,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_workers: self.config.max_workers,
            tick_interval: Duration::from_millis(self.config.tick_interval_ms.max(10)),
            shutdown_grace: Duration::from_secs(self.config.shutdown_grace_secs),
        }
    }
}
