use chrono::Utc;
use tracing::{info, warn};
use vmjobs_core::JobKind;
use vmjobs_tsdb::GaugeSample;
use vmjobs_workflow::{RunReport, RunStatus};

use crate::context::JobContext;

/// `<kind>_job_status`: 1 for a successful run, 0 otherwise.
pub fn status_gauge(ctx: &JobContext, kind: JobKind, report: &RunReport) -> GaugeSample {
    let value = if report.status == RunStatus::Success { 1.0 } else { 0.0 };
    GaugeSample::new(format!("{}_job_status", kind.as_str()), value, Utc::now())
        .labels(ctx.labels.clone())
        .label("job_id", &report.job_id)
        .label("status", report.status.as_str())
        .label("env", &ctx.env)
}

/// Pushes the status gauge. Failures are logged and otherwise ignored.
pub async fn publish_status(ctx: &JobContext, kind: JobKind, report: &RunReport) {
    let gauge = status_gauge(ctx, kind, report);
    match ctx.tsdb.push(&[gauge]).await {
        Ok(()) => info!(job_id = %report.job_id, status = %report.status, "Published job status metric"),
        Err(e) => warn!(job_id = %report.job_id, error = %e, "Failed to publish job status metric"),
    }
}
