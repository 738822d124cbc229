use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;
use vmjobs_core::{JobDefinition, JobError, JobKind};
use vmjobs_workflow::{RunReport, WorkflowEngine};

use crate::collector::Collector;
use crate::context::JobContext;
use crate::extractor::Extractor;
use crate::converter::Converter;
use crate::metrics_extract::MetricsExtract;
use crate::params::{self, CollectorParams, ConverterParams, ExtractorParams, MetricsExtractParams};

/// Runs one job to completion. Never fails: bad params and step errors end up
/// in the returned report.
pub async fn run_job(engine: &WorkflowEngine, ctx: &JobContext, def: &JobDefinition) -> RunReport {
    run_job_at(engine, ctx, def, Utc::now()).await
}

/// [`run_job`] with an explicit wall-clock instant.
pub async fn run_job_at(
    engine: &WorkflowEngine,
    ctx: &JobContext,
    def: &JobDefinition,
    now: DateTime<Utc>,
) -> RunReport {
    match def.kind {
        JobKind::Extractor => match extractor_params(def) {
            Ok(p) => engine.run(def, &Extractor::new(ctx.clone(), p).at(now)).await,
            Err(e) => engine.rejected(def, e),
        },
        JobKind::Collector => match collector_params(def) {
            Ok(p) => {
                let job = Collector::new(ctx.clone(), &def.id, p).at(now);
                engine.run(def, &job).await
            }
            Err(e) => engine.rejected(def, e),
        },
        JobKind::Converter => match converter_params(def) {
            Ok(p) => engine.run(def, &Converter::new(ctx.clone(), p).at(now)).await,
            Err(e) => engine.rejected(def, e),
        },
        JobKind::MetricsExtract => match metrics_extract_params(def) {
            Ok(p) => engine.run(def, &MetricsExtract::new(ctx.clone(), p).at(now)).await,
            Err(e) => engine.rejected(def, e),
        },
    }
}

/// Moves a collector's watermark to `date`, earlier or later. Returns the
/// previous watermark.
pub async fn backfill(
    ctx: &JobContext,
    def: &JobDefinition,
    date: NaiveDate,
) -> Result<Option<NaiveDate>, JobError> {
    if def.kind != JobKind::Collector {
        return Err(JobError::Configuration(format!(
            "job {} is a {} job, only collectors keep a date watermark",
            def.id, def.kind
        )));
    }
    let job = Collector::new(ctx.clone(), &def.id, collector_params(def)?);
    let key = job.stream_key();
    let previous = job.watermarks().backfill(&key, date).await?;
    info!(job_id = %def.id, stream = %key, ?previous, %date, "Watermark reset");
    Ok(previous)
}

/// Parses and validates params without running anything.
pub fn validate(def: &JobDefinition) -> Result<(), JobError> {
    match def.kind {
        JobKind::Extractor => extractor_params(def).map(|_| ()),
        JobKind::Collector => collector_params(def).map(|_| ()),
        JobKind::Converter => converter_params(def).map(|_| ()),
        JobKind::MetricsExtract => metrics_extract_params(def).map(|_| ()),
    }
}

fn extractor_params(def: &JobDefinition) -> Result<ExtractorParams, JobError> {
    let p: ExtractorParams = params::parse(def)?;
    p.validate()?;
    Ok(p)
}

fn collector_params(def: &JobDefinition) -> Result<CollectorParams, JobError> {
    let p: CollectorParams = params::parse(def)?;
    p.validate()?;
    Ok(p)
}

fn converter_params(def: &JobDefinition) -> Result<ConverterParams, JobError> {
    let p: ConverterParams = params::parse(def)?;
    p.validate()?;
    Ok(p)
}

fn metrics_extract_params(def: &JobDefinition) -> Result<MetricsExtractParams, JobError> {
    let p: MetricsExtractParams = params::parse(def)?;
    p.validate()?;
    Ok(p)
}
