use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use vmjobs_scheduler::SchedulerHandle;

pub fn build_router(scheduler: SchedulerHandle) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(scheduler)
}

/// GET /health: liveness check with the jobs currently running.
pub async fn health_handler(State(scheduler): State<SchedulerHandle>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "jobs": scheduler.job_count(),
        "running": scheduler.running(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use vmjobs_core::JobDefinition;
    use vmjobs_lock::LockManager;
    use vmjobs_scheduler::{EngineSettings, JobRegistry, JobRunner, SchedulerEngine};
    use vmjobs_workflow::RunReport;

    struct Unused;

    #[async_trait]
    impl JobRunner for Unused {
        async fn run(&self, _def: &JobDefinition) -> RunReport {
            unreachable!("health checks never run jobs")
        }
    }

    #[tokio::test]
    async fn health_reports_jobs() {
        let jobs: Vec<JobDefinition> = serde_json::from_value(serde_json::json!([
            { "id": "a", "kind": "extractor", "schedule": { "type": "interval", "every_secs": 60 } },
            { "id": "b", "kind": "collector", "schedule": { "type": "interval", "every_secs": 60 } },
        ]))
        .unwrap();
        let registry = Arc::new(JobRegistry::load(jobs).unwrap());
        let engine = SchedulerEngine::new(
            registry,
            LockManager::unlocked(),
            Arc::new(Unused),
            EngineSettings::default(),
            None,
        );

        let response = build_router(engine.handle())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["jobs"], 2);
        assert_eq!(v["running"], json!([]));
    }
}
