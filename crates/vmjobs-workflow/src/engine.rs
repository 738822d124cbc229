use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};
use vmjobs_core::redact::Redactor;
use vmjobs_core::{JobDefinition, JobError};

use crate::report::RunReport;
use crate::state::{RunStatus, WorkflowState};
use crate::step::{JobType, StepOutcome};

/// Runs a job type's steps in order, stops at the first failure and always
/// finalizes into a [`RunReport`].
///
/// A panicking step is caught here and reported as an unexpected fault, so
/// nothing a step does can take the scheduler down or lose the report.
#[derive(Clone, Default)]
pub struct WorkflowEngine {
    redactor: Redactor,
}

impl WorkflowEngine {
    pub fn new(redactor: Redactor) -> Self {
        Self { redactor }
    }

    pub async fn run<J: JobType>(&self, def: &JobDefinition, job: &J) -> RunReport {
        let mut state: WorkflowState<J::State> = WorkflowState::new(&def.id);
        info!(job_id = %def.id, job_type = job.name(), "Job started");

        let mut failed_step = None;
        let mut partial = Vec::new();

        for step in job.steps() {
            debug!(job_id = %def.id, step = step.name, "Running step");
            let result = AssertUnwindSafe((step.run)(job, &mut state))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(JobError::UnexpectedFault(panic_message(panic))));

            match result {
                Ok(StepOutcome::Complete) => {}
                Ok(StepOutcome::Partial(msg)) => {
                    warn!(job_id = %def.id, step = step.name, "{msg}");
                    partial.push(msg);
                }
                Err(e) => {
                    error!(job_id = %def.id, step = step.name, error = %e, "Step failed");
                    state.error = Some(e);
                    failed_step = Some(step.name);
                    break;
                }
            }
        }

        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| job.finalize(&mut state))) {
            let e = JobError::UnexpectedFault(panic_message(panic));
            error!(job_id = %def.id, error = %e, "Finalize panicked");
            if state.error.is_none() {
                state.error = Some(e);
                failed_step = Some("finalize");
            }
        }
        state.completed_at = Some(Utc::now());
        state.status = match (&state.error, partial.is_empty()) {
            (Some(_), _) => RunStatus::Error,
            (None, false) => RunStatus::Partial,
            (None, true) => RunStatus::Success,
        };
        let message = match (&state.error, failed_step) {
            (Some(e), Some(step)) => format!("Job failed at step {step}: {e}"),
            _ if !partial.is_empty() => partial.join("; "),
            _ => state
                .message
                .take()
                .unwrap_or_else(|| "Job completed successfully".to_string()),
        };

        let report = RunReport {
            job_id: def.id.clone(),
            job_display_name: def.display_name().to_string(),
            job_description: def.description.clone(),
            started_at: state.started_at,
            completed_at: state.completed_at.unwrap_or_else(Utc::now),
            status: state.status,
            message,
            error: state.error.as_ref().map(|e| e.to_string()),
            error_code: state.error.as_ref().map(JobError::code),
            execution_time_seconds: state.execution_time_seconds(),
            job_config: self.redactor.redact(&def.params),
            outputs: state.take_outputs(),
        };

        info!(
            job_id = %def.id,
            status = %report.status,
            elapsed_secs = report.execution_time_seconds,
            "Job finished"
        );

        if AssertUnwindSafe(job.after_finalize(&report))
            .catch_unwind()
            .await
            .is_err()
        {
            warn!(job_id = %def.id, "Post-run hook panicked");
        }
        report
    }

    /// Report for a run that could not start, e.g. invalid job params.
    pub fn rejected(&self, def: &JobDefinition, err: JobError) -> RunReport {
        let now = Utc::now();
        error!(job_id = %def.id, error = %err, "Job rejected before start");
        RunReport {
            job_id: def.id.clone(),
            job_display_name: def.display_name().to_string(),
            job_description: def.description.clone(),
            started_at: now,
            completed_at: now,
            status: RunStatus::Error,
            message: format!("Job failed before start: {err}"),
            error: Some(err.to_string()),
            error_code: Some(err.code()),
            execution_time_seconds: 0.0,
            job_config: self.redactor.redact(&def.params),
            outputs: serde_json::Map::new(),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("step panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("step panicked: {s}")
    } else {
        "step panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{Step, StepFuture};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vmjobs_core::{JobKind, Schedule};

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        AllOk,
        FailSecond,
        PanicSecond,
        PartialSecond,
        PanicFinalize,
    }

    struct ThreeStep {
        mode: Mode,
        third_ran: AtomicBool,
        hook_ran: AtomicBool,
    }

    impl ThreeStep {
        fn new(mode: Mode) -> Self {
            Self {
                mode,
                third_ran: AtomicBool::new(false),
                hook_ran: AtomicBool::new(false),
            }
        }
    }

    fn first<'a>(_job: &'a ThreeStep, state: &'a mut WorkflowState<u32>) -> StepFuture<'a> {
        Box::pin(async move {
            state.data += 1;
            state.record("first_output", "kept");
            Ok(StepOutcome::Complete)
        })
    }

    fn second<'a>(job: &'a ThreeStep, state: &'a mut WorkflowState<u32>) -> StepFuture<'a> {
        Box::pin(async move {
            state.data += 1;
            match job.mode {
                Mode::AllOk | Mode::PanicFinalize => Ok(StepOutcome::Complete),
                Mode::FailSecond => Err(JobError::Persistence("disk full".into())),
                Mode::PanicSecond => panic!("bad index"),
                Mode::PartialSecond => Ok(StepOutcome::Partial("1 of 2 units failed".into())),
            }
        })
    }

    fn third<'a>(job: &'a ThreeStep, state: &'a mut WorkflowState<u32>) -> StepFuture<'a> {
        Box::pin(async move {
            job.third_ran.store(true, Ordering::SeqCst);
            state.record("steps_run", state.data + 1);
            Ok(StepOutcome::Complete)
        })
    }

    static STEPS: &[Step<ThreeStep>] = &[
        Step { name: "first", run: first },
        Step { name: "second", run: second },
        Step { name: "third", run: third },
    ];

    #[async_trait::async_trait]
    impl JobType for ThreeStep {
        type State = u32;

        fn name(&self) -> &str {
            "three_step"
        }

        fn steps(&self) -> &'static [Step<Self>] {
            STEPS
        }

        fn finalize(&self, _state: &mut WorkflowState<u32>) {
            if self.mode == Mode::PanicFinalize {
                panic!("summary overflow");
            }
        }

        async fn after_finalize(&self, _report: &RunReport) {
            self.hook_ran.store(true, Ordering::SeqCst);
        }
    }

    fn def() -> JobDefinition {
        JobDefinition {
            id: "three_step_job".into(),
            name: Some("Three step".into()),
            description: "test".into(),
            enabled: true,
            kind: JobKind::Extractor,
            schedule: Schedule::Interval { every_secs: 60 },
            params: json!({ "source_token": "abcdefgh", "cutoff_hour": 6 }),
        }
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let job = ThreeStep::new(Mode::AllOk);
        let report = WorkflowEngine::default().run(&def(), &job).await;
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.output_u64("steps_run"), Some(3));
        assert!(report.error.is_none());
        assert!(job.hook_ran.load(Ordering::SeqCst));
        assert_eq!(report.job_config["source_token"], "ab****gh");
    }

    #[tokio::test]
    async fn failure_short_circuits_and_keeps_earlier_outputs() {
        let job = ThreeStep::new(Mode::FailSecond);
        let report = WorkflowEngine::default().run(&def(), &job).await;
        assert_eq!(report.status, RunStatus::Error);
        assert!(!job.third_ran.load(Ordering::SeqCst));
        assert_eq!(report.outputs["first_output"], "kept");
        assert_eq!(report.error_code, Some("PERSISTENCE_ERROR"));
        assert!(report.message.contains("second"));
        assert!(report.completed_at >= report.started_at);
        assert!(job.hook_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panic_becomes_unexpected_fault() {
        let job = ThreeStep::new(Mode::PanicSecond);
        let report = WorkflowEngine::default().run(&def(), &job).await;
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.error_code, Some("UNEXPECTED_FAULT"));
        assert!(report.error.as_deref().unwrap().contains("bad index"));
        assert_eq!(report.outputs["first_output"], "kept");
    }

    #[tokio::test]
    async fn panic_in_finalize_still_reports() {
        let job = ThreeStep::new(Mode::PanicFinalize);
        let report = WorkflowEngine::default().run(&def(), &job).await;
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.error_code, Some("UNEXPECTED_FAULT"));
        assert!(report.error.as_deref().unwrap().contains("summary overflow"));
        assert!(report.message.contains("finalize"));
        assert_eq!(report.output_u64("steps_run"), Some(3));
        assert!(job.hook_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn partial_keeps_running() {
        let job = ThreeStep::new(Mode::PartialSecond);
        let report = WorkflowEngine::default().run(&def(), &job).await;
        assert_eq!(report.status, RunStatus::Partial);
        assert!(job.third_ran.load(Ordering::SeqCst));
        assert_eq!(report.message, "1 of 2 units failed");
    }

    #[test]
    fn document_shape() {
        let engine = WorkflowEngine::default();
        let report = engine.rejected(&def(), JobError::Configuration("missing source_url".into()));
        let doc = serde_json::to_value(&report).unwrap();
        assert_eq!(doc["status"], "error");
        assert_eq!(doc["error_code"], "CONFIG_ERROR");
        assert_eq!(doc["job_display_name"], "Three step");
        assert!(doc.get("execution_time_seconds").is_some());
    }
}
