use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};
use vmjobs_core::JobDefinition;

use crate::error::{Result, SchedulerError};
use crate::schedule::validate;

/// The configured job definitions.
///
/// Readers take a cheap snapshot; a reload swaps the whole list at once so a
/// tick never sees a half-applied config.
pub struct JobRegistry {
    jobs: RwLock<Arc<Vec<JobDefinition>>>,
    shut_down: AtomicBool,
}

impl JobRegistry {
    pub fn load(jobs: Vec<JobDefinition>) -> Result<Self> {
        check(&jobs)?;
        info!(
            count = jobs.len(),
            enabled = jobs.iter().filter(|j| j.enabled).count(),
            "Job registry loaded"
        );
        Ok(Self {
            jobs: RwLock::new(Arc::new(jobs)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Replaces every definition. On error the previous set stays in place.
    pub fn reload(&self, jobs: Vec<JobDefinition>) -> Result<()> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        check(&jobs)?;
        let count = jobs.len();
        *self.jobs.write().unwrap() = Arc::new(jobs);
        info!(count, "Job registry reloaded");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<Vec<JobDefinition>> {
        Arc::clone(&self.jobs.read().unwrap())
    }

    pub fn get(&self, id: &str) -> Result<JobDefinition> {
        self.snapshot()
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting reloads. Snapshots stay readable so in-flight runs can
    /// finish.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            info!("Job registry shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

fn check(jobs: &[JobDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for job in jobs {
        if !seen.insert(job.id.as_str()) {
            return Err(SchedulerError::DuplicateJob { id: job.id.clone() });
        }
        validate(job)?;
        if !job.enabled {
            warn!(job_id = %job.id, "Job is disabled");
        }
    }
    Ok(())
}
