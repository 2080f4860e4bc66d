use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
    routing::{get, post},
};
use uuid::Uuid;

use crate::{
    error::{EngineError, EngineResult},
    metrics::MetricsRegistry,
    models::{Job, JobStatus, JobView, SubmitRequest, SubmitResponse},
    queue::JobQueue,
    store::ResultStore,
};

/// Slack on top of the code limit for the JSON envelope around it.
const BODY_OVERHEAD_BYTES: usize = 16 * 1024;

#[derive(Clone)]
pub struct AppState {
    queue: JobQueue,
    store: ResultStore,
    metrics: Arc<MetricsRegistry>,
    max_code_bytes: usize,
}

pub fn routes(
    queue: JobQueue,
    store: ResultStore,
    metrics_registry: Arc<MetricsRegistry>,
    max_code_bytes: usize,
) -> Router {
    let state = AppState {
        queue,
        store,
        metrics: metrics_registry,
        max_code_bytes,
    };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/jobs", post(submit_job))
        .route("/v1/jobs/{id}", get(get_job))
        .layer(DefaultBodyLimit::max(
            max_code_bytes.saturating_add(BODY_OVERHEAD_BYTES),
        ))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn submit_job(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> EngineResult<(StatusCode, Json<SubmitResponse>)> {
    let Json(request) = body.map_err(|rejection| match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => EngineError::PayloadTooLarge {
            limit: state.max_code_bytes,
        },
        _ => EngineError::InvalidRequest(rejection.body_text()),
    })?;

    let code = validate_code(request.code, state.max_code_bytes)?;
    let job = Job::new(code);
    state.queue.enqueue(&job).await?;
    state.metrics.submitted();

    tracing::info!(job_id = %job.job_id, bytes = job.code.len(), "job queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.job_id,
            status: JobStatus::Pending,
        }),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> EngineResult<Json<JobView>> {
    let Path(id) = id.map_err(|rejection| EngineError::InvalidRequest(rejection.body_text()))?;
    Ok(Json(state.store.lookup(id).await?))
}

fn validate_code(code: Option<String>, max_code_bytes: usize) -> EngineResult<String> {
    let code = code.unwrap_or_default();
    if code.trim().is_empty() {
        return Err(EngineError::InvalidRequest("no code provided".to_string()));
    }
    if code.len() > max_code_bytes {
        return Err(EngineError::PayloadTooLarge {
            limit: max_code_bytes,
        });
    }
    Ok(code)
}
