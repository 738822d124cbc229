//! Persistence for job runs: the relational run-tracking and extracted-data
//! tables, written one atomic unit at a time, the per-selector series tables,
//! and per-stream watermarks kept as a gauge in the time-series store.

pub mod db;
pub mod error;
pub mod runs;
pub mod series;
pub mod types;
pub mod watermark;
pub mod writer;

pub use db::{init_db, open};
pub use error::{Result, StoreError};
pub use runs::RunQueries;
pub use series::{ExtractRunStatus, ExtractRunSummary, SeriesRecord, SeriesStore};
pub use types::{ExtractedRecord, JobRunRecord, UnitOfWork, UnitStats};
pub use watermark::{StreamKey, WatermarkStore};
pub use writer::BatchWriter;
