use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, error, info, warn};
use vmjobs_core::{JobError, JobKind};
use vmjobs_store::{StreamKey, WatermarkStore};
use vmjobs_tsdb::{GaugeSample, Selector, Series};
use vmjobs_workflow::calendar::{day_start, derive_business_date};
use vmjobs_workflow::{step, JobType, RunReport, Step, StepOutcome, WorkflowState};

use crate::context::JobContext;
use crate::params::ConverterParams;
use crate::status::publish_status;

const SOURCE_WATERMARK: &str = "business_date_converter_source_wm";
const DAY_WATERMARK: &str = "business_date_converter_day_wm";
const CONVERTED_SUFFIX: &str = "_converted";

/// Republishes `biz_date`-labelled series at a timestamp inside their business
/// date, under `job="<job>_converted"`.
///
/// Two watermarks drive it: a per-job source watermark (newest input sample
/// already converted) and a per-day cursor that hands out strictly increasing
/// output timestamps within each business date.
pub struct Converter {
    ctx: JobContext,
    params: ConverterParams,
    now: DateTime<Utc>,
}

#[derive(Default)]
pub struct ConverterState {
    business_date: Option<NaiveDate>,
    source_watermarks: BTreeMap<String, Option<DateTime<Utc>>>,
    /// Per job: where the source watermark moves after this run.
    advance_to: BTreeMap<String, DateTime<Utc>>,
    metrics_processed: u64,
    metrics_converted: u64,
    failed_count: u64,
}

type State = WorkflowState<ConverterState>;

/// Latest input point of one series, ready to convert.
struct Pending {
    name: String,
    labels: BTreeMap<String, String>,
    business_date: NaiveDate,
    value: f64,
    timestamp: DateTime<Utc>,
}

static STEPS: &[Step<Converter>] = &[
    step!(Converter, derive_business_date),
    step!(Converter, read_source_watermarks),
    step!(Converter, convert_series),
    step!(Converter, advance_source_watermarks),
];

impl Converter {
    pub fn new(ctx: JobContext, params: ConverterParams) -> Self {
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

    fn watermarks(&self) -> WatermarkStore {
        self.ctx
            .watermarks
            .clone()
            .with_lookback_days(self.params.watermark_lookback_days)
    }

    pub fn source_key(job: &str) -> StreamKey {
        StreamKey::new(SOURCE_WATERMARK).label("job", job)
    }

    pub fn day_key(job: &str, day: NaiveDate) -> StreamKey {
        StreamKey::new(DAY_WATERMARK)
            .label("job", job)
            .label("biz_date", day.to_string())
    }

    async fn derive_business_date(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let date = derive_business_date(self.now, self.params.cutoff_hour);
        info!(job_id = %state.job_id, business_date = %date, "Current business date");
        state.data.business_date = Some(date);
        state.record("current_business_date", date);
        Ok(StepOutcome::Complete)
    }

    async fn read_source_watermarks(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let watermarks = self.watermarks();
        for job in &self.params.jobs {
            let wm = match watermarks.read_instant(&Self::source_key(job)).await {
                Ok(wm) => wm,
                Err(e) => {
                    warn!(job_id = %state.job_id, job = %job, error = %e, "Failed to read source watermark, converting from scratch");
                    None
                }
            };
            match wm {
                Some(at) => info!(job_id = %state.job_id, job = %job, watermark = %at, "Source watermark loaded"),
                None => info!(job_id = %state.job_id, job = %job, "No source watermark"),
            }
            state.data.source_watermarks.insert(job.clone(), wm);
        }
        Ok(StepOutcome::Complete)
    }

    async fn convert_series(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let mut last_error = None;
        for job in &self.params.jobs {
            let wm = state.data.source_watermarks.get(job).copied().flatten();
            let start = match wm {
                Some(at) => at - Duration::seconds(self.params.source_overlap_secs as i64),
                None => self.now - Duration::days(self.params.source_initial_lookback_days as i64),
            };

            let series = match self
                .ctx
                .tsdb
                .query_range(&Selector::any().with("job", job), start, self.now, None)
                .await
            {
                Ok(series) => series,
                Err(e) => {
                    error!(job_id = %state.job_id, job = %job, error = %e, "Source query failed");
                    state.data.failed_count += 1;
                    last_error = Some(JobError::from(e));
                    continue;
                }
            };

            let pending = pending_after(series, wm);
            info!(job_id = %state.job_id, job = %job, series = pending.len(), "Series newer than source watermark");
            if pending.is_empty() {
                continue;
            }

            let mut newest_ok: Option<DateTime<Utc>> = None;
            let mut oldest_failed: Option<DateTime<Utc>> = None;
            for (day, items) in group_by_day(pending) {
                let count = items.len() as u64;
                state.data.metrics_processed += count;
                let newest = items.iter().map(|p| p.timestamp).max();
                let oldest = items.iter().map(|p| p.timestamp).min();
                match self.convert_day(job, day, &items).await {
                    Ok(()) => {
                        state.data.metrics_converted += count;
                        newest_ok = newest_ok.max(newest);
                    }
                    Err(e) => {
                        error!(job_id = %state.job_id, job = %job, business_date = %day, error = %e, "Conversion failed");
                        state.data.failed_count += count;
                        oldest_failed = match (oldest_failed, oldest) {
                            (Some(a), Some(b)) => Some(a.min(b)),
                            (a, b) => a.or(b),
                        };
                        last_error = Some(e);
                    }
                }
            }

            // Failed inputs stay above the watermark so the next run retries them.
            let target = match oldest_failed {
                Some(failed) => Some(failed - Duration::milliseconds(1)),
                None => newest_ok,
            };
            if let Some(target) = target.filter(|t| wm.map_or(true, |w| *t > w)) {
                state.data.advance_to.insert(job.clone(), target);
            }
        }

        let (converted, failed) = (state.data.metrics_converted, state.data.failed_count);
        state.record("metrics_processed", state.data.metrics_processed);
        state.record("metrics_converted", converted);
        info!(job_id = %state.job_id, converted, failed, "Conversion complete");

        match last_error {
            Some(e) if converted == 0 => Err(e),
            Some(_) => Ok(StepOutcome::Partial(format!(
                "Conversion completed with warnings: {converted} successes, {failed} failures"
            ))),
            None => Ok(StepOutcome::Complete),
        }
    }

    async fn advance_source_watermarks(&self, state: &mut State) -> Result<StepOutcome, JobError> {
        let watermarks = self.watermarks();
        let mut failed = Vec::new();
        for (job, target) in &state.data.advance_to {
            match watermarks.advance_instant(&Self::source_key(job), *target).await {
                Ok(_) => info!(job_id = %state.job_id, job = %job, watermark = %target, "Source watermark advanced"),
                Err(e) => {
                    warn!(job_id = %state.job_id, job = %job, error = %e, "Failed to advance source watermark");
                    failed.push(job.as_str());
                }
            }
        }
        if failed.is_empty() {
            Ok(StepOutcome::Complete)
        } else {
            Ok(StepOutcome::Partial(format!(
                "Source watermark not advanced for {}",
                failed.join(", ")
            )))
        }
    }

    /// Allocates output timestamps for one business date, pushes the batch and
    /// moves the day cursor past it.
    async fn convert_day(&self, job: &str, day: NaiveDate, items: &[Pending]) -> Result<(), JobError> {
        let watermarks = self.watermarks();
        let key = Self::day_key(job, day);
        let first = day_start(day);
        let last = first + Duration::seconds(86_399);

        let mut cursor = match watermarks.read_instant(&key).await {
            Ok(Some(at)) => at,
            Ok(None) => first - Duration::seconds(1),
            Err(e) => {
                debug!(job = %job, business_date = %day, error = %e, "Day cursor unreadable, starting at midnight");
                first - Duration::seconds(1)
            }
        };

        let mut samples = Vec::with_capacity(items.len());
        for item in items {
            cursor = (cursor + Duration::seconds(1)).max(first);
            samples.push(converted_sample(item, cursor.min(last)));
        }
        self.ctx.tsdb.push(&samples).await?;
        watermarks.advance_instant(&key, cursor).await?;
        debug!(job = %job, business_date = %day, converted = samples.len(), cursor = %cursor, "Business date converted");
        Ok(())
    }
}

/// Newest point of every `biz_date` series whose newest point is past `wm`.
fn pending_after(series: Vec<Series>, wm: Option<DateTime<Utc>>) -> Vec<Pending> {
    let mut out = Vec::new();
    for s in series {
        let Some(name) = s.name().map(str::to_string) else {
            continue;
        };
        let Some(latest) = s.latest().copied() else {
            continue;
        };
        if wm.is_some_and(|w| latest.timestamp <= w) {
            continue;
        }
        let Some(raw) = s.labels.get("biz_date").filter(|v| !v.is_empty()) else {
            continue;
        };
        let Ok(business_date) = NaiveDate::parse_from_str(raw, "%d/%m/%Y") else {
            warn!(metric = %name, biz_date = %raw, "Invalid biz_date, skipping");
            continue;
        };
        let labels = s
            .labels
            .into_iter()
            .filter(|(k, _)| k != vmjobs_tsdb::types::NAME_LABEL && k != "biz_date")
            .collect();
        out.push(Pending {
            name,
            labels,
            business_date,
            value: latest.value,
            timestamp: latest.timestamp,
        });
    }
    out
}

/// Groups by business date, each group ordered by input timestamp.
fn group_by_day(mut pending: Vec<Pending>) -> BTreeMap<NaiveDate, Vec<Pending>> {
    pending.sort_by_key(|p| (p.business_date, p.timestamp));
    let mut days: BTreeMap<NaiveDate, Vec<Pending>> = BTreeMap::new();
    for p in pending {
        days.entry(p.business_date).or_default().push(p);
    }
    days
}

fn converted_sample(item: &Pending, at: DateTime<Utc>) -> GaugeSample {
    let mut labels = item.labels.clone();
    if let Some(job) = labels.get_mut("job") {
        job.push_str(CONVERTED_SUFFIX);
    }
    GaugeSample::new(&item.name, item.value, at).labels(labels)
}

#[async_trait]
impl JobType for Converter {
    type State = ConverterState;

    fn name(&self) -> &str {
        JobKind::Converter.as_str()
    }

    fn steps(&self) -> &'static [Step<Self>] {
        STEPS
    }

    fn finalize(&self, state: &mut State) {
        let processed = state.data.metrics_processed;
        let converted = state.data.metrics_converted;
        state.record("metrics_processed", processed);
        state.record("metrics_converted", converted);
        state.record("processed_count", converted);
        state.record("failed_count", state.data.failed_count);
        state.record("success_rate", converted as f64 / processed.max(1) as f64 * 100.0);
        state.record("jobs", &self.params.jobs);
        state.message = Some(format!(
            "Business date conversion completed for job: {} - {converted} metrics converted",
            state.job_id
        ));
    }

    async fn after_finalize(&self, report: &RunReport) {
        publish_status(&self.ctx, JobKind::Converter, report).await;
    }
}
