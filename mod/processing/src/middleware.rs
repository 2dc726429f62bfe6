//! Worker token authentication middleware.
//!
//! Resolves the request's worker credential to an active worker row and
//! stores it in request extensions for handlers to consume. Rejects
//! before any task state is read.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use siteproof_core::ServiceError;

use crate::engine::TaskEngine;

/// Header carrying the worker secret. `Authorization: Bearer <token>`
/// is accepted as an alternative.
pub const WORKER_TOKEN_HEADER: &str = "x-worker-token";

/// Middleware guarding worker-facing routes.
pub async fn worker_auth(
    State(engine): State<Arc<TaskEngine>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let token = extract_token(&request)
        .ok_or_else(|| ServiceError::Unauthorized("worker token missing or invalid".into()))?;

    let worker = engine.authenticate(&token)?;
    request.extensions_mut().insert(worker);

    Ok(next.run(request).await)
}

fn extract_token(request: &Request) -> Option<String> {
    if let Some(token) = request
        .headers()
        .get(WORKER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
