use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::{error, info, warn};
use vmjobs_core::{JobError, JobKind};
use vmjobs_store::{StreamKey, WatermarkStore};
use vmjobs_tsdb::GaugeSample;
use vmjobs_workflow::calendar::{
    day_start, derive_business_date, preceding_weekdays, subtract_business_days, weekdays_between,
};
use vmjobs_workflow::{step, JobType, RunReport, Step, StepOutcome, WorkflowState};

use crate::context::JobContext;
use crate::params::CollectorParams;
use crate::status::publish_status;

/// Upstream REST source → time-series store, resuming from a watermark.
pub struct Collector {
    ctx: JobContext,
    job_id: String,
    params: CollectorParams,
    now: DateTime<Utc>,
}

#[derive(Default)]
pub struct CollectorState {
    business_date: Option<NaiveDate>,
    watermark: Option<NaiveDate>,
    weekdays: Vec<NaiveDate>,
    to_update: Vec<NaiveDate>,
    succeeded: BTreeSet<NaiveDate>,
    failed: BTreeSet<NaiveDate>,
    published_samples: usize,
}

type State = WorkflowState<CollectorState>;

static STEPS: &[Step<Collector>] = &[
    step!(Collector, derive_business_date),
    step!(Collector, read_watermark),
    step!(Collector, derive_weekdays),
    step!(Collector, derive_weekdays_to_update),
    step!(Collector, process_weekdays),
    step!(Collector, advance_watermark),
];

impl Collector {
    pub fn new(ctx: JobContext, job_id: &str, params: CollectorParams) -> Self {
        Self {
            ctx,
            job_id: job_id.to_string(),
            params,
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// The watermark gauge this job reads and advances.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(&self.params.watermark_metric)
            .label("source", &self.params.source_name)
            .label("job", &self.job_id)
            .label("env", &self.ctx.env)
    }

    async fn derive_business_date(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let date = derive_business_date(self.now, self.params.cutoff_hour);
        info!(job_id = %state.job_id, business_date = %date, "Current business date");
        state.data.business_date = Some(date);
        state.record("current_business_date", date);
        Ok(StepOutcome::Complete)
    }

    /// The shared watermark store with this job's lookback window.
    pub fn watermarks(&self) -> WatermarkStore {
        self.ctx
            .watermarks
            .clone()
            .with_lookback_days(self.params.watermark_lookback_days)
    }

    async fn read_watermark(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        state.data.watermark = match self.watermarks().read(&self.stream_key()).await {
            Ok(w) => w,
            Err(e) => {
                warn!(job_id = %state.job_id, error = %e, "Failed to read watermark, treating as absent");
                None
            }
        };
        match state.data.watermark {
            Some(w) => info!(job_id = %state.job_id, watermark = %w, "Watermark loaded"),
            None => info!(job_id = %state.job_id, "No watermark found"),
        }
        state.record("watermark_date", state.data.watermark);
        Ok(StepOutcome::Complete)
    }

    async fn derive_weekdays(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let business_date = state
            .data
            .business_date
            .ok_or_else(|| JobError::UnexpectedFault("business date not derived".into()))?;
        let end = subtract_business_days(business_date, self.params.data_lag_business_days.max(1));

        if let Some(w) = state.data.watermark {
            if w >= end {
                let clamped = end.pred_opt().unwrap_or(end);
                warn!(job_id = %state.job_id, watermark = %w, %end, %clamped, "Watermark ahead of effective end date, clamping");
                state.data.watermark = Some(clamped);
            }
        }

        let start = match (state.data.watermark, self.params.backfill_start_date) {
            (Some(w), _) => w.succ_opt().unwrap_or(w),
            (None, Some(backfill)) => backfill,
            (None, None) => end
                .checked_sub_days(chrono::Days::new(self.params.start_date_offset_days as u64))
                .unwrap_or(end),
        };

        // Oldest first: the watermark may only move through dates this run fetches.
        let mut weekdays = weekdays_between(start, end);
        if weekdays.len() > self.params.max_days_per_run {
            weekdays.truncate(self.params.max_days_per_run);
            info!(job_id = %state.job_id, limit = self.params.max_days_per_run, "Trimmed to max_days_per_run");
        }
        info!(job_id = %state.job_id, %start, %end, count = weekdays.len(), "Derived weekdays");
        state.record("weekdays_processed", weekdays.len());
        state.data.weekdays = weekdays;
        Ok(StepOutcome::Complete)
    }

    async fn derive_weekdays_to_update(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let mut dates: BTreeSet<NaiveDate> = state.data.weekdays.iter().copied().collect();
        let before = dates.len();
        if self.params.sliding_window_days > 0 {
            for day in &state.data.weekdays {
                dates.extend(preceding_weekdays(*day, self.params.sliding_window_days));
            }
            info!(job_id = %state.job_id, added = dates.len() - before, "Added dates from sliding window");
        }
        let to_update: Vec<NaiveDate> = dates.into_iter().collect();
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

        let mut last_error = None;
        for day in state.data.to_update.clone() {
            match self.collect_day(day).await {
                Ok(published) => {
                    info!(job_id = %state.job_id, business_date = %day, published, "Processed business date");
                    state.data.published_samples += published;
                    state.data.succeeded.insert(day);
                }
                Err(e) => {
                    error!(job_id = %state.job_id, business_date = %day, error = %e, "Failed to process business date");
                    state.data.failed.insert(day);
                    last_error = Some(e);
                }
            }
        }

        let (ok, failed) = (state.data.succeeded.len(), state.data.failed.len());
        state.record("published_samples", state.data.published_samples);
        info!(job_id = %state.job_id, ok, failed, "Processing complete");

        match last_error {
            Some(e) if ok == 0 => Err(e),
            Some(_) => Ok(StepOutcome::Partial(format!(
                "Collection completed with warnings: {ok} successes, {failed} failures"
            ))),
            None => Ok(StepOutcome::Complete),
        }
    }

    /// Advances through the longest run of consecutive successes among the
    /// newly selected dates. A failed date stops the watermark in front of it
    /// even if later dates succeeded.
    async fn advance_watermark(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let target = sequential_watermark(&state.data.weekdays, &state.data.succeeded);
        let Some(target) = target else {
            info!(job_id = %state.job_id, "No successful processing to advance watermark");
            return Ok(StepOutcome::Complete);
        };
        if state.data.watermark.is_some_and(|w| w >= target) {
            return Ok(StepOutcome::Complete);
        }

        match self.watermarks().advance(&self.stream_key(), target).await {
            Ok(_) => {
                state.data.watermark = Some(target);
                state.record("watermark_date", target);
                Ok(StepOutcome::Complete)
            }
            Err(e) => {
                warn!(job_id = %state.job_id, error = %e, "Failed to advance watermark");
                Ok(StepOutcome::Partial(format!("Watermark not advanced to {target}: {e}")))
            }
        }
    }

    /// Fetches one business date and pushes its numeric fields. Returns the
    /// number of samples published.
    async fn collect_day(&self, day: NaiveDate) -> Result<usize, JobError> {
        let params = vec![("business_date".to_string(), day.to_string())];
        let payload = self
            .ctx
            .source
            .fetch(&self.params.source_url, self.params.source_token.as_deref(), &params)
            .await?;

        let items = filter_items(payload, day);
        if items.is_empty() {
            return Err(JobError::DataValidation(format!("no source data for {day}")));
        }

        let samples = self.to_samples(day, &items);
        if samples.is_empty() {
            return Err(JobError::DataValidation(format!("no numeric fields for {day}")));
        }
        self.ctx.tsdb.push(&samples).await?;
        Ok(samples.len())
    }

    fn to_samples(&self, day: NaiveDate, items: &[serde_json::Map<String, Value>]) -> Vec<GaugeSample> {
        let at = day_start(day);
        let mut samples = Vec::new();
        for item in items {
            for (field, value) in item {
                let Some(v) = numeric(value) else { continue };
                samples.push(
                    GaugeSample::new(format!("{}_{}", self.params.metric_name, field), v, at)
                        .label("business_date", day.to_string())
                        .label("source", &self.params.source_name)
                        .label("job", &self.job_id)
                        .labels(self.ctx.labels.clone())
                        .labels(self.params.labels.clone()),
                );
            }
        }
        samples
    }
}

/// Last date of the leading run of successes in `dates` (ascending).
pub fn sequential_watermark(dates: &[NaiveDate], succeeded: &BTreeSet<NaiveDate>) -> Option<NaiveDate> {
    dates
        .iter()
        .take_while(|d| succeeded.contains(d))
        .last()
        .copied()
}

/// Keeps objects whose `business_date` matches `day`. Items without the field,
/// or with a value that does not parse, are kept.
fn filter_items(payload: Value, day: NaiveDate) -> Vec<serde_json::Map<String, Value>> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .filter(|map| match map.get("business_date").and_then(Value::as_str) {
            Some(s) => parse_item_date(s).map_or(true, |d| d == day),
            None => true,
        })
        .collect()
}

fn parse_item_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc).date_naive()))
        .or_else(|| s.get(..10).and_then(|p| NaiveDate::parse_from_str(p, "%Y-%m-%d").ok()))
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[async_trait]
impl JobType for Collector {
    type State = CollectorState;

    fn name(&self) -> &str {
        JobKind::Collector.as_str()
    }

    fn steps(&self) -> &'static [Step<Self>] {
        STEPS
    }

    fn finalize(&self, state: &mut State) {
        let processed = state.data.succeeded.len();
        let failed = state.data.failed.len();
        let total = processed + failed;
        let success_rate = if total == 0 {
            0.0
        } else {
            processed as f64 / total as f64 * 100.0
        };
        state.record("processed_count", processed);
        state.record("failed_count", failed);
        state.record("success_rate", success_rate);
        state.record("published_samples", state.data.published_samples);
        state.message = Some(format!(
            "Collection completed for job: {} - {processed} successes",
            self.job_id
        ));
    }

    async fn after_finalize(&self, report: &RunReport) {
        publish_status(&self.ctx, JobKind::Collector, report).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn watermark_stops_at_first_failure() {
        let dates = [d(8), d(9), d(10)];
        let ok: BTreeSet<_> = [d(8), d(10)].into_iter().collect();
        assert_eq!(sequential_watermark(&dates, &ok), Some(d(8)));

        let ok: BTreeSet<_> = dates.iter().copied().collect();
        assert_eq!(sequential_watermark(&dates, &ok), Some(d(10)));

        let ok: BTreeSet<_> = [d(9), d(10)].into_iter().collect();
        assert_eq!(sequential_watermark(&dates, &ok), None);
    }

    #[test]
    fn items_filtered_by_business_date() {
        let payload = json!([
            { "business_date": "2024-01-09", "total": 1 },
            { "business_date": "2024-01-10T00:00:00Z", "total": 2 },
            { "business_date": "not a date", "total": 3 },
            { "total": 4 },
            "ignored",
        ]);
        let items = filter_items(payload, d(9));
        let totals: Vec<i64> = items.iter().map(|m| m["total"].as_i64().unwrap()).collect();
        assert_eq!(totals, vec![1, 3, 4]);

        assert_eq!(filter_items(json!({ "total": 5 }), d(9)).len(), 1);
        assert!(filter_items(Value::Null, d(9)).is_empty());
    }
}
