//! HTTP job API.
//!
//! - `GET /health` reports runner status (503 until ready)
//! - `POST /runsync` runs one job and returns `{ id, status, output }`

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use llamapod_protocol::{Job, JobOutput, JobResponse, RunnerStatus};

use crate::job::JobHandler;
use crate::proxy::CompletionProxy;
use crate::runner::RunnerState;

/// Application state shared across handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub runner: Arc<RunnerState>,
    pub jobs: JobHandler,
}

impl AppState {
    pub fn new(runner: Arc<RunnerState>) -> Result<Self, reqwest::Error> {
        let jobs = JobHandler::new(CompletionProxy::new(Arc::clone(&runner))?);
        Ok(Self { runner, jobs })
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runsync", post(run_sync))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<RunnerStatus>) {
    let status = state.runner.status();
    let code = if status.is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

async fn run_sync(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<JobResponse>) {
    let raw = match payload {
        Ok(Json(raw)) => raw,
        Err(rejection) => {
            warn!("rejected job body: {}", rejection.body_text());
            let output = JobOutput::error(format!("invalid job body: {}", rejection.body_text()));
            return (
                StatusCode::BAD_REQUEST,
                Json(JobResponse::new(new_job_id(), output)),
            );
        }
    };

    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(new_job_id);

    let job: Job = match serde_json::from_value(raw) {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id = %id, "invalid job input: {}", e);
            let output = JobOutput::error(format!("invalid job input: {e}"));
            return (StatusCode::BAD_REQUEST, Json(JobResponse::new(id, output)));
        }
    };

    info!(job_id = %id, "running job");
    let output = state.jobs.handle(&job).await;
    let response = JobResponse::new(id, output);
    info!(job_id = %response.id, status = ?response.status, "job finished");
    (StatusCode::OK, Json(response))
}

fn new_job_id() -> String {
    format!("sync-{}", Uuid::new_v4())
}
