use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error, info, warn};
use vmjobs_core::{JobError, JobKind};
use vmjobs_store::{ExtractedRecord, UnitOfWork};
use vmjobs_tsdb::{Sample, Selector};
use vmjobs_workflow::calendar::{
    biz_date_label, derive_business_date, extraction_end, extraction_windows, weekday_range,
};
use vmjobs_workflow::reconcile::{plan, Timestamps};
use vmjobs_workflow::{step, JobType, RunReport, Step, StepOutcome, WorkflowState};

use crate::context::JobContext;
use crate::params::ExtractorParams;
use crate::status::publish_status;

/// Labels that become columns rather than part of the stored label set.
const STANDARD_LABELS: &[&str] = &["__name__", "job", "source", "biz_date"];

type Labels = BTreeMap<String, String>;

/// Time-series store → relational store, one business date per unit.
pub struct Extractor {
    ctx: JobContext,
    params: ExtractorParams,
    now: DateTime<Utc>,
}

#[derive(Default)]
pub struct ExtractorState {
    business_date: Option<NaiveDate>,
    weekdays: Vec<NaiveDate>,
    timestamps: Timestamps,
    to_update: Vec<NaiveDate>,
    units_committed: u64,
    units_failed: u64,
    records_saved: u64,
    records_failed: u64,
}

type State = WorkflowState<ExtractorState>;

static STEPS: &[Step<Extractor>] = &[
    step!(Extractor, derive_business_date),
    step!(Extractor, derive_weekdays),
    step!(Extractor, associate_sink_timestamps),
    step!(Extractor, associate_source_timestamps),
    step!(Extractor, derive_weekdays_to_update),
    step!(Extractor, process_weekdays),
];

impl Extractor {
    pub fn new(ctx: JobContext, params: ExtractorParams) -> Self {
        Self {
            ctx,
            params,
            now: Utc::now(),
        }
    }

    /// Pins the run's notion of "now".
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

    async fn derive_weekdays(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let date = business_date(state)?;
        let weekdays = weekday_range(date, self.params.start_date_offset_days);
        info!(job_id = %state.job_id, count = weekdays.len(), "Derived weekdays");
        state.record("weekdays_processed", weekdays.len());
        state.data.weekdays = weekdays;
        Ok(StepOutcome::Complete)
    }

    async fn associate_sink_timestamps(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let sink = self
            .ctx
            .runs
            .latest_max_data_timestamps(&state.job_id, &state.data.weekdays)?;
        debug!(job_id = %state.job_id, known = sink.len(), "Loaded sink timestamps");
        state.data.timestamps.sink = sink;
        Ok(StepOutcome::Complete)
    }

    async fn associate_source_timestamps(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let end = extraction_end(self.now);
        let weekdays = state.data.weekdays.clone();
        for day in weekdays {
            match self.fetch_latest(&state.job_id, day, end).await {
                Ok(latest) => {
                    if let Some(ts) = self.newest_keyed(&latest) {
                        state.data.timestamps.source.insert(day, ts);
                    }
                }
                // Unknown source timestamps count as stale.
                Err(e) => warn!(job_id = %state.job_id, business_date = %day, error = %e, "Source timestamp lookup failed"),
            }
        }
        info!(
            job_id = %state.job_id,
            known = state.data.timestamps.source.len(),
            "Retrieved source timestamps"
        );
        Ok(StepOutcome::Complete)
    }

    async fn derive_weekdays_to_update(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let planned = plan(
            &state.data.weekdays,
            &state.data.timestamps,
            self.params.sliding_window_days,
        );
        for (day, decision) in &planned {
            debug!(job_id = %state.job_id, business_date = %day, ?decision, "Reconciled");
        }
        let to_update: Vec<NaiveDate> = planned
            .into_iter()
            .filter(|(_, d)| d.needs_update())
            .map(|(day, _)| day)
            .collect();
        info!(job_id = %state.job_id, count = to_update.len(), "Selected weekdays for extraction");
        state.record("weekdays_to_update", &to_update);
        state.record("weekdays_updated", to_update.len());
        state.data.to_update = to_update;
        Ok(StepOutcome::Complete)
    }

    async fn process_weekdays(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        if state.data.to_update.is_empty() {
            info!(job_id = %state.job_id, "No weekdays to update");
            return Ok(StepOutcome::Complete);
        }

        let end = extraction_end(self.now);
        let mut last_error = None;
        for day in state.data.to_update.clone() {
            let mut unit = UnitOfWork::new(&state.job_id, day, state.started_at);
            let latest = match self.fetch_latest(&state.job_id, day, end).await {
                Ok(latest) => latest,
                Err(e) => {
                    let e = JobError::from(e);
                    self.fail_unit(&unit, &e);
                    state.data.units_failed += 1;
                    last_error = Some(e);
                    continue;
                }
            };

            for (labels, sample) in &latest {
                match self.to_record(day, labels, *sample) {
                    Ok(record) => unit.records.push(record),
                    Err(e) => {
                        warn!(job_id = %state.job_id, business_date = %day, error = %e, "Skipping record");
                        unit.records_failed += 1;
                    }
                }
            }

            match self.ctx.writer.commit_unit(&unit) {
                Ok(stats) => {
                    state.data.units_committed += 1;
                    state.data.records_saved += stats.records_processed;
                    state.data.records_failed += stats.records_failed;
                }
                Err(e) => {
                    let e = JobError::from(e);
                    self.fail_unit(&unit, &e);
                    state.data.units_failed += 1;
                    state.data.records_failed += unit.records.len() as u64 + unit.records_failed;
                    last_error = Some(e);
                }
            }
        }

        let (committed, failed) = (state.data.units_committed, state.data.units_failed);
        state.record("units_committed", committed);
        state.record("units_failed", failed);
        state.record("records_saved", state.data.records_saved);
        info!(job_id = %state.job_id, committed, failed, "Extraction complete");

        match last_error {
            Some(e) if committed == 0 => Err(e),
            Some(_) => Ok(StepOutcome::Partial(format!(
                "{failed} of {} business dates failed",
                committed + failed
            ))),
            None => Ok(StepOutcome::Complete),
        }
    }

    /// All chunks for a business date, reduced to the newest sample of each
    /// series.
    async fn fetch_latest(
        &self,
        job_id: &str,
        day: NaiveDate,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<Labels, Sample>, vmjobs_tsdb::TsdbError> {
        let mut selector = Selector::any()
            .with("biz_date", biz_date_label(day))
            .with("job", job_id);
        for (k, v) in &self.params.selector {
            selector = selector.with(k, v);
        }
        let step = self.params.query_step_secs.map(Duration::from_secs);

        let mut latest: BTreeMap<Labels, Sample> = BTreeMap::new();
        for window in extraction_windows(day, end, self.params.chunk_size_days) {
            let series = self
                .ctx
                .tsdb
                .query_range(&selector, window.chunk_start, window.chunk_end, step)
                .await?;
            for s in series {
                let Some(newest) = s.latest().copied() else {
                    continue;
                };
                latest
                    .entry(s.labels)
                    .and_modify(|cur| {
                        if newest.timestamp > cur.timestamp {
                            *cur = newest;
                        }
                    })
                    .or_insert(newest);
            }
        }
        debug!(job_id, business_date = %day, series = latest.len(), "Fetched source data");
        Ok(latest)
    }

    /// Newest timestamp among series that carry the key label. Unkeyed series
    /// are never written, so they must not count towards staleness either.
    fn newest_keyed(&self, latest: &BTreeMap<Labels, Sample>) -> Option<DateTime<Utc>> {
        latest
            .iter()
            .filter(|(labels, _)| labels.contains_key(&self.params.key_label))
            .map(|(_, s)| s.timestamp)
            .max()
    }

    fn to_record(&self, day: NaiveDate, labels: &Labels, sample: Sample) -> Result<ExtractedRecord, JobError> {
        let key_label = self.params.key_label.as_str();
        let metric_name = labels
            .get("__name__")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        let record_key = labels.get(key_label).cloned().ok_or_else(|| {
            JobError::DataValidation(format!("{metric_name} is missing the {key_label} label"))
        })?;
        let business_date = labels
            .get("biz_date")
            .and_then(|s| NaiveDate::parse_from_str(s, "%d/%m/%Y").ok())
            .unwrap_or(day);
        let rest = labels
            .iter()
            .filter(|(k, _)| k.as_str() != key_label && !STANDARD_LABELS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(ExtractedRecord {
            business_date,
            record_key,
            metric_name,
            value: sample.value,
            timestamp: sample.timestamp,
            labels: rest,
        })
    }

    fn fail_unit(&self, unit: &UnitOfWork, err: &JobError) {
        error!(job_id = %unit.job_id, business_date = %unit.business_date, error = %err, "Extraction unit failed");
        if let Err(e) = self.ctx.writer.record_failure(unit, &err.to_string()) {
            error!(job_id = %unit.job_id, error = %e, "Could not record failed unit");
        }
    }
}

fn business_date(state: &State) -> Result<NaiveDate, JobError> {
    state
        .data
        .business_date
        .ok_or_else(|| JobError::UnexpectedFault("business date not derived".into()))
}

#[async_trait]
impl JobType for Extractor {
    type State = ExtractorState;

    fn name(&self) -> &str {
        JobKind::Extractor.as_str()
    }

    fn steps(&self) -> &'static [Step<Self>] {
        STEPS
    }

    fn finalize(&self, state: &mut State) {
        state.record("processed_count", state.data.records_saved);
        state.record("failed_count", state.data.records_failed);
    }

    async fn after_finalize(&self, report: &RunReport) {
        publish_status(&self.ctx, JobKind::Extractor, report).await;
    }
}
