use async_trait::async_trait;
use futures_util::future::BoxFuture;
use vmjobs_core::JobError;

use crate::report::RunReport;
use crate::state::WorkflowState;

pub type StepFuture<'a> = BoxFuture<'a, Result<StepOutcome, JobError>>;

/// How a step that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Complete,
    /// Some sub-units failed while others committed. Later steps still run;
    /// the run ends `partial`.
    Partial(String),
}

/// One named stage of a job type's pipeline.
pub struct Step<J: JobType> {
    pub name: &'static str,
    pub run: for<'a> fn(&'a J, &'a mut WorkflowState<J::State>) -> StepFuture<'a>,
}

/// Builds a [`Step`] that calls an async method of the job type:
/// `async fn name(&self, state: &mut WorkflowState<Self::State>) -> Result<StepOutcome, JobError>`.
#[macro_export]
macro_rules! step {
    ($job:ty, $method:ident) => {{
        fn run<'a>(
            job: &'a $job,
            state: &'a mut $crate::WorkflowState<<$job as $crate::JobType>::State>,
        ) -> $crate::StepFuture<'a> {
            Box::pin(job.$method(state))
        }
        $crate::Step::<$job> {
            name: stringify!($method),
            run,
        }
    }};
}

/// A job type: a fixed, ordered list of steps over a typed working state.
#[async_trait]
pub trait JobType: Send + Sync + Sized + 'static {
    type State: Default + Send;

    fn name(&self) -> &str;

    /// Resolved once per type; the engine runs them in order.
    fn steps(&self) -> &'static [Step<Self>];

    /// Last chance to record summary outputs. Runs after every run, whether
    /// or not a step failed.
    fn finalize(&self, _state: &mut WorkflowState<Self::State>) {}

    /// Called with the finished result document, e.g. to publish a status
    /// gauge. Must not fail the run.
    async fn after_finalize(&self, _report: &RunReport) {}
}
