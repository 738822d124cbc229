use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vmjobs_scheduler::RunSummary;
use vmjobs_tsdb::{GaugeSample, TimeSeriesStore};

/// Value of the `job` label on run metrics.
const RUN_METRICS_JOB: &str = "vmj";

/// Gauges describing one finished run.
pub fn run_metrics(summary: &RunSummary) -> Vec<GaugeSample> {
    let now = Utc::now();
    let gauge = |name: &str, value: f64| {
        GaugeSample::new(name, value, now)
            .label("job", RUN_METRICS_JOB)
            .label("vmj_job", &summary.job_id)
    };
    let start_ms = summary.started_at.timestamp_millis();
    let end_ms = summary.completed_at.timestamp_millis();

    let mut out = vec![
        gauge("vmj_run_time", (end_ms - start_ms).max(0) as f64),
        gauge("vmj_start_time", start_ms as f64),
        gauge("vmj_end_time", end_ms as f64),
    ];
    if let Some(n) = summary.processed {
        out.push(gauge("vmj_number_of_processed_metrics", n as f64));
    }
    if let Some(n) = summary.failed {
        out.push(gauge("vmj_number_of_failed_metrics", n as f64));
    }
    out
}

/// Pushes run metrics until every sender is dropped.
pub async fn run(tsdb: Arc<dyn TimeSeriesStore>, mut rx: mpsc::Receiver<RunSummary>) {
    while let Some(summary) = rx.recv().await {
        let samples = run_metrics(&summary);
        match tsdb.push(&samples).await {
            Ok(()) => debug!(job_id = %summary.job_id, status = %summary.status, "Run metrics pushed"),
            Err(e) => warn!(job_id = %summary.job_id, error = %e, "Failed to push run metrics"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vmjobs_tsdb::MemoryTimeSeries;
    use vmjobs_workflow::RunStatus;

    fn summary(processed: Option<u64>) -> RunSummary {
        RunSummary {
            run_id: Default::default(),
            job_id: "apex".into(),
            status: RunStatus::Success,
            started_at: Utc.with_ymd_and_hms(2024, 1, 15, 7, 0, 0).unwrap(),
            completed_at: Utc.with_ymd_and_hms(2024, 1, 15, 7, 0, 2).unwrap(),
            processed,
            failed: None,
        }
    }

    #[test]
    fn metric_set() {
        let m = run_metrics(&summary(Some(12)));
        let names: Vec<&str> = m.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "vmj_run_time",
                "vmj_start_time",
                "vmj_end_time",
                "vmj_number_of_processed_metrics"
            ]
        );
        assert_eq!(m[0].value, 2000.0);
        assert_eq!(m[0].labels["job"], "vmj");
        assert_eq!(m[0].labels["vmj_job"], "apex");

        assert_eq!(run_metrics(&summary(None)).len(), 3);
    }

    #[tokio::test]
    async fn reporter_pushes_until_closed() {
        let tsdb = Arc::new(MemoryTimeSeries::new());
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run(tsdb.clone(), rx));
        tx.send(summary(Some(1))).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(tsdb.series_named("vmj_run_time").len(), 1);
    }
}
