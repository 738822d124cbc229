use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{error, info, warn};
use vmjobs_core::{JobError, JobKind};
use vmjobs_store::{ExtractRunStatus, ExtractRunSummary, SeriesRecord};
use vmjobs_tsdb::types::NAME_LABEL;
use vmjobs_tsdb::{Selector, Series};
use vmjobs_workflow::calendar::derive_business_date;
use vmjobs_workflow::{step, JobType, RunReport, Step, StepOutcome, WorkflowState};

use crate::context::JobContext;
use crate::params::MetricsExtractParams;
use crate::status::publish_status;

/// Copies whole series from the time-series store into the relational store,
/// one selector at a time. Each selector resumes from the newest sample its
/// previous run saved.
pub struct MetricsExtract {
    ctx: JobContext,
    params: MetricsExtractParams,
    now: DateTime<Utc>,
}

#[derive(Default)]
pub struct MetricsExtractState {
    business_date: Option<NaiveDate>,
    series_processed: u64,
    metrics_saved: u64,
    failed_series: u64,
    failed_selectors: u64,
    series_error: Option<JobError>,
}

type State = WorkflowState<MetricsExtractState>;

static STEPS: &[Step<MetricsExtract>] = &[
    step!(MetricsExtract, derive_business_date),
    step!(MetricsExtract, process_selectors),
];

impl MetricsExtract {
    pub fn new(ctx: JobContext, params: MetricsExtractParams) -> Self {
        Self {
            ctx,
            params,
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    async fn derive_business_date(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let date = derive_business_date(self.now, self.params.cutoff_hour);
        info!(job_id = %state.job_id, business_date = %date, "Current business date");
        state.data.business_date = Some(date);
        state.record("current_business_date", date);
        Ok(StepOutcome::Complete)
    }

    async fn process_selectors(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        info!(job_id = %state.job_id, selectors = self.params.metric_selectors.len(), "Processing metric selectors");
        let mut last_error = None;
        for expr in &self.params.metric_selectors {
            if let Err(e) = self.extract_selector(state, expr).await {
                error!(job_id = %state.job_id, selector = %expr, error = %e, "Selector failed");
                state.data.failed_selectors += 1;
                last_error = Some(e);
            }
        }
        if let Some(e) = state.data.series_error.take() {
            last_error.get_or_insert(e);
        }

        let d = &state.data;
        let (saved, failed) = (d.metrics_saved, d.failed_series + d.failed_selectors);
        info!(
            job_id = %state.job_id,
            series = d.series_processed,
            saved,
            failed,
            "Extraction processing complete"
        );
        state.record("series_processed", state.data.series_processed);
        state.record("metrics_saved_count", saved);

        match last_error {
            Some(e) if saved == 0 => Err(e),
            Some(_) => Ok(StepOutcome::Partial(format!(
                "Extraction completed with warnings: {failed} failed, {saved} metrics saved"
            ))),
            None => Ok(StepOutcome::Complete),
        }
    }

    /// One selector: open a run row, query since the resume point, save every
    /// series and close the row. A failed series does not stop the others but
    /// keeps the resume point where it was. Only selector-level failures are
    /// returned.
    async fn extract_selector(&self, state: &mut State, expr: &str) -> Result<(), JobError> {
        let selector = Selector::parse(expr).map_err(|e| JobError::Configuration(e.to_string()))?;
        let series_store = &self.ctx.series;
        let run_id = series_store.start_run(&state.job_id, expr)?;

        let last = series_store.last_timestamp(&state.job_id, expr).unwrap_or_else(|e| {
            warn!(job_id = %state.job_id, selector = %expr, error = %e, "Could not read resume point");
            None
        });
        let start = match last {
            Some(at) => {
                info!(job_id = %state.job_id, selector = %expr, last_timestamp = %at, "Resuming extraction");
                at
            }
            None => {
                info!(job_id = %state.job_id, selector = %expr, days = self.params.initial_lookback_days, "No previous extraction, using initial lookback");
                self.now - Duration::days(self.params.initial_lookback_days as i64)
            }
        };

        let step = StdDuration::from_secs(self.params.step_secs);
        let series = match self.ctx.tsdb.query_range(&selector, start, self.now, Some(step)).await {
            Ok(series) => series,
            Err(e) => {
                self.close_run(run_id, 0, 0, None, ExtractRunStatus::Failed);
                return Err(e.into());
            }
        };

        let mut series_count = 0;
        let mut saved = 0;
        let mut newest: Option<DateTime<Utc>> = None;
        let mut failures = 0;
        for s in series {
            let Some(record) = to_record(s) else { continue };
            match series_store.save_series(&state.job_id, run_id, &record) {
                Ok((0, _)) => {}
                Ok((written, series_newest)) => {
                    series_count += 1;
                    saved += written;
                    newest = newest.max(series_newest);
                }
                Err(e) => {
                    error!(job_id = %state.job_id, metric = %record.metric_name, error = %e, "Failed to save series");
                    failures += 1;
                    state.data.series_error = Some(e.into());
                }
            }
        }
        state.data.series_processed += series_count;
        state.data.metrics_saved += saved;
        state.data.failed_series += failures;

        let (resume, status) = if failures > 0 {
            (None, ExtractRunStatus::Failed)
        } else {
            (Some(newest.unwrap_or(self.now)), ExtractRunStatus::Completed)
        };
        self.close_run(run_id, series_count, saved, resume, status);
        info!(job_id = %state.job_id, selector = %expr, series = series_count, saved, "Selector complete");
        Ok(())
    }

    fn close_run(
        &self,
        run_id: i64,
        series_count: u64,
        metrics_saved: u64,
        last_timestamp: Option<DateTime<Utc>>,
        status: ExtractRunStatus,
    ) {
        let summary = ExtractRunSummary {
            series_count,
            metrics_saved,
            last_timestamp,
            status,
        };
        if let Err(e) = self.ctx.series.finish_run(run_id, &summary) {
            warn!(run_id, error = %e, "Failed to update extract run record");
        }
    }
}

fn to_record(series: Series) -> Option<SeriesRecord> {
    let metric_name = series.name()?.to_string();
    if series.samples.is_empty() {
        return None;
    }
    let labels = series
        .labels
        .into_iter()
        .filter(|(k, _)| k != NAME_LABEL)
        .collect();
    Some(SeriesRecord {
        metric_name,
        labels,
        samples: series.samples.iter().map(|s| (s.timestamp, s.value)).collect(),
    })
}

#[async_trait]
impl JobType for MetricsExtract {
    type State = MetricsExtractState;

    fn name(&self) -> &str {
        JobKind::MetricsExtract.as_str()
    }

    fn steps(&self) -> &'static [Step<Self>] {
        STEPS
    }

    fn finalize(&self, state: &mut State) {
        let d = &state.data;
        let (series, saved, failed) = (d.series_processed, d.metrics_saved, d.failed_series);
        let failed_selectors = d.failed_selectors;
        state.record("series_processed", series);
        state.record("metrics_saved_count", saved);
        state.record("failed_series", failed);
        state.record("failed_selectors", failed_selectors);
        state.record("processed_count", saved);
        state.record("failed_count", failed + failed_selectors);
        state.message = Some(if series == 0 {
            "No matching series to extract".to_string()
        } else {
            format!("Extraction completed: {series} series processed, {saved} metrics saved")
        });
    }

    async fn after_finalize(&self, report: &RunReport) {
        publish_status(&self.ctx, JobKind::MetricsExtract, report).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vmjobs_tsdb::Sample;

    #[test]
    fn series_without_name_or_samples_are_skipped() {
        let at = Utc.timestamp_opt(1_705_312_800, 0).unwrap();
        let mut labels: std::collections::BTreeMap<String, String> =
            [("desk".to_string(), "rates".to_string())].into_iter().collect();
        let unnamed = Series {
            labels: labels.clone(),
            samples: vec![Sample { timestamp: at, value: 1.0 }],
        };
        assert!(to_record(unnamed).is_none());

        labels.insert(NAME_LABEL.to_string(), "balance".to_string());
        let empty = Series {
            labels: labels.clone(),
            samples: Vec::new(),
        };
        assert!(to_record(empty).is_none());

        let record = to_record(Series {
            labels,
            samples: vec![Sample { timestamp: at, value: 2.0 }],
        })
        .unwrap();
        assert_eq!(record.metric_name, "balance");
        assert_eq!(record.labels.len(), 1);
        assert_eq!(record.samples, vec![(at, 2.0)]);
    }
}
