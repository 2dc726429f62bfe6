//! Worker-facing endpoints: claim, heartbeat, status, result.
//!
//! All routes sit behind the worker token middleware; handlers receive
//! the authenticated worker via request extensions.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::middleware;
use axum::routing::{patch, post};
use axum::{Extension, Json, Router};

use siteproof_core::ServiceError;

use crate::engine::TaskEngine;
use crate::middleware::worker_auth;
use crate::model::{
    ClaimBatchRequest, HeartbeatRequest, ResultRequest, StatusUpdateRequest, Task, Worker,
};

type EngineState = Arc<TaskEngine>;

pub fn router(engine: Arc<TaskEngine>) -> Router {
    Router::new()
        .route("/worker/tasks/next", post(claim_one))
        .route("/worker/tasks/next_batch", post(claim_batch))
        .route("/worker/tasks/{id}/status", patch(update_status))
        .route("/worker/tasks/{id}/heartbeat", patch(heartbeat))
        .route("/worker/tasks/{id}/result", post(submit_result))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&engine),
            worker_auth,
        ))
        .with_state(engine)
}

// ---------------------------------------------------------------------------
// POST /worker/tasks/next
// ---------------------------------------------------------------------------

async fn claim_one(
    State(engine): State<EngineState>,
    Extension(worker): Extension<Worker>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let task = engine.claim_one(&worker)?;
    Ok(Json(serde_json::json!({ "task": task })))
}

// ---------------------------------------------------------------------------
// POST /worker/tasks/next_batch
// ---------------------------------------------------------------------------

async fn claim_batch(
    State(engine): State<EngineState>,
    Extension(worker): Extension<Worker>,
    Json(req): Json<ClaimBatchRequest>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let limit = req.limit.unwrap_or(5);
    let tasks = engine.claim_batch(&worker, limit)?;
    Ok(Json(serde_json::json!({ "tasks": tasks })))
}

// ---------------------------------------------------------------------------
// PATCH /worker/tasks/:id/status
// ---------------------------------------------------------------------------

async fn update_status(
    State(engine): State<EngineState>,
    Extension(worker): Extension<Worker>,
    Path(id): Path<String>,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<Json<Task>, ServiceError> {
    let task = engine.set_status(&id, &worker, req.status, req.error)?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// PATCH /worker/tasks/:id/heartbeat
// ---------------------------------------------------------------------------

async fn heartbeat(
    State(engine): State<EngineState>,
    Extension(worker): Extension<Worker>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<Task>, ServiceError> {
    let task = engine.heartbeat(&id, &worker, req.progress)?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// POST /worker/tasks/:id/result
// ---------------------------------------------------------------------------

async fn submit_result(
    State(engine): State<EngineState>,
    Extension(worker): Extension<Worker>,
    Path(id): Path<String>,
    Json(req): Json<ResultRequest>,
) -> Result<Json<Task>, ServiceError> {
    let task = engine.submit_result(&id, &worker, req.result.as_ref(), req.result_ref.as_deref())?;
    Ok(Json(task))
}
