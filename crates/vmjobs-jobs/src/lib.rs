//! The concrete job types.
//!
//! - [`extractor`] copies data from the time-series store into the relational
//!   store, re-extracting only business dates whose source data is newer than
//!   what was last written.
//! - [`collector`] pulls figures from an upstream REST source into the
//!   time-series store, resuming from a per-stream watermark.
//! - [`converter`] republishes `biz_date`-labelled series on their business
//!   date's own timeline.
//! - [`metrics_extract`] copies whole series per selector into the relational
//!   store, resuming from the last extracted timestamp.

pub mod collector;
pub mod context;
pub mod converter;
pub mod extractor;
pub mod metrics_extract;
pub mod params;
pub mod runner;
pub mod source;
pub mod status;

pub use context::JobContext;
pub use runner::{backfill, run_job, run_job_at};
pub use source::{HttpSourceClient, MemorySource, SourceClient, SourceError};
