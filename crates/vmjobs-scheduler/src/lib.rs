//! `vmjobs-scheduler`: tick-driven dispatch of configured jobs.
//!
//! # Overview
//!
//! The [`registry::JobRegistry`] holds the configured definitions. The
//! [`engine::SchedulerEngine`] checks fire times every tick and hands due jobs
//! to a bounded worker pool. A job never overlaps itself: an in-process guard
//! skips a fire while the previous run is still going, and the advisory lock
//! does the same across processes.
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                          |
//! |------------|----------------------------------------------------|
//! | `Cron`     | Six-field cron expression (seconds first), UTC     |
//! | `Interval` | Repeat every N seconds                             |
//! | `Date`     | Single fire at an absolute UTC instant             |

pub mod engine;
pub mod error;
pub mod registry;
pub mod schedule;

pub use engine::{EngineSettings, JobRunner, RunSummary, SchedulerEngine, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use registry::JobRegistry;
pub use schedule::compute_next_run;
