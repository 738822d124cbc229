//! Step-pipeline execution for jobs, plus the business-date calendar and
//! reconciliation rules the concrete jobs build on.

pub mod calendar;
pub mod engine;
pub mod reconcile;
pub mod report;
pub mod state;
pub mod step;

pub use engine::WorkflowEngine;
pub use report::RunReport;
pub use state::{RunStatus, WorkflowState};
pub use step::{JobType, Step, StepFuture, StepOutcome};
