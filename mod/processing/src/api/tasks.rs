//! Producer-facing endpoints: submit, status, result, list.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use siteproof_core::ServiceError;

use crate::engine::TaskEngine;
use crate::model::{
    SubmitTaskRequest, TaskListQuery, TaskResultResponse, TaskStatusResponse,
};

type EngineState = Arc<TaskEngine>;

pub fn router(engine: Arc<TaskEngine>) -> Router {
    Router::new()
        .route("/tasks/submit", post(submit_task))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}/status", get(task_status))
        .route("/tasks/{id}/result", get(task_result))
        .with_state(engine)
}

// ---------------------------------------------------------------------------
// POST /tasks/submit
// ---------------------------------------------------------------------------

async fn submit_task(
    State(engine): State<EngineState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ServiceError> {
    let task = engine.submit(req)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": task.id })),
    ))
}

// ---------------------------------------------------------------------------
// GET /tasks
// ---------------------------------------------------------------------------

async fn list_tasks(
    State(engine): State<EngineState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let result = engine.list(&query)?;
    Ok(Json(serde_json::json!({
        "items": result.items,
        "total": result.total,
    })))
}

// ---------------------------------------------------------------------------
// GET /tasks/:id/status
// ---------------------------------------------------------------------------

async fn task_status(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ServiceError> {
    let task = engine.get(&id)?;
    Ok(Json(TaskStatusResponse::from(&task)))
}

// ---------------------------------------------------------------------------
// GET /tasks/:id/result
// ---------------------------------------------------------------------------

async fn task_result(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResultResponse>, ServiceError> {
    let task = engine.result(&id)?;
    Ok(Json(TaskResultResponse::from(&task)))
}
