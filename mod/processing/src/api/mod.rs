mod tasks;
mod worker;

use std::sync::Arc;

use axum::Router;

use crate::engine::TaskEngine;

/// Build the complete processing module router.
///
/// Producer routes (no auth):
/// - `POST  /tasks/submit`               — submit a task
/// - `GET   /tasks`                      — list tasks
/// - `GET   /tasks/{id}/status`          — status + progress
/// - `GET   /tasks/{id}/result`          — result, once done
///
/// Worker routes (worker token required):
/// - `POST  /worker/tasks/next`          — claim one task
/// - `POST  /worker/tasks/next_batch`    — claim up to N tasks
/// - `PATCH /worker/tasks/{id}/status`   — announce a status transition
/// - `PATCH /worker/tasks/{id}/heartbeat`— renew the lease
/// - `POST  /worker/tasks/{id}/result`   — report the result (implies done)
pub fn router(engine: Arc<TaskEngine>) -> Router {
    Router::new()
        .merge(tasks::router(Arc::clone(&engine)))
        .merge(worker::router(engine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Task, TaskStatus};
    use crate::store::TaskStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use siteproof_core::now_rfc3339;
    use siteproof_sql::{SqlStore, SqliteStore};
    use tower::ServiceExt;

    const TOKEN: &str = "test-worker-token";

    fn make_app() -> (Router, Arc<TaskEngine>) {
        let db: Arc<dyn SqlStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = Arc::new(TaskStore::new(db).unwrap());
        let engine = Arc::new(TaskEngine::new(store));
        engine
            .store()
            .ensure_worker("test-worker", TOKEN, &now_rfc3339())
            .unwrap();
        (router(Arc::clone(&engine)), engine)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("x-worker-token", token);
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn submit(app: &Router, payload_ref: &str) -> String {
        let (status, body) = send(
            app,
            "POST",
            "/tasks/submit",
            None,
            Some(serde_json::json!({"payloadRef": payload_ref})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn submit_and_read_status() {
        let (app, _engine) = make_app();
        let id = submit(&app, "https://example.com").await;

        let (status, body) = send(&app, "GET", &format!("/tasks/{id}/status"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "new");
        assert_eq!(body["priority"], "normal");
        assert_eq!(body["error"], "");
    }

    #[tokio::test]
    async fn submit_rejects_missing_payload() {
        let (app, _engine) = make_app();
        let (status, _) = send(
            &app,
            "POST",
            "/tasks/submit",
            None,
            Some(serde_json::json!({"payloadRef": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_of_unknown_task_is_404() {
        let (app, _engine) = make_app();
        let (status, body) = send(&app, "GET", "/tasks/nope/status", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn worker_routes_require_token() {
        let (app, _engine) = make_app();

        let (status, body) = send(&app, "POST", "/worker/tasks/next", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHENTICATED");

        let (status, _) = send(&app, "POST", "/worker/tasks/next", Some("wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bearer_header_is_accepted() {
        let (app, _engine) = make_app();
        submit(&app, "https://example.com").await;

        let request = Request::builder()
            .method("POST")
            .uri("/worker/tasks/next")
            .header("authorization", format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn claim_returns_task_then_null() {
        let (app, _engine) = make_app();
        let id = submit(&app, "https://example.com").await;

        let (status, body) = send(&app, "POST", "/worker/tasks/next", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task"]["id"], id.as_str());
        assert_eq!(body["task"]["status"], "in_progress");

        let (status, body) = send(&app, "POST", "/worker/tasks/next", Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["task"].is_null());
    }

    #[tokio::test]
    async fn batch_claim_returns_all_available() {
        let (app, _engine) = make_app();
        for i in 0..3 {
            submit(&app, &format!("https://example.com/{i}")).await;
        }

        let (status, body) = send(
            &app,
            "POST",
            "/worker/tasks/next_batch",
            Some(TOKEN),
            Some(serde_json::json!({"limit": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tasks"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn heartbeat_and_result_flow() {
        let (app, engine) = make_app();
        let id = submit(&app, "https://example.com").await;
        send(&app, "POST", "/worker/tasks/next", Some(TOKEN), None).await;

        let (status, body) = send(
            &app,
            "PATCH",
            &format!("/worker/tasks/{id}/heartbeat"),
            Some(TOKEN),
            Some(serde_json::json!({"progress": 42.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["progress"], 42.0);

        let (status, body) = send(&app, "GET", &format!("/tasks/{id}/status"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["progress"], 42.0);
        assert_eq!(body["status"], "in_progress");

        // Result is not readable yet.
        let (status, _) = send(&app, "GET", &format!("/tasks/{id}/result"), None, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/worker/tasks/{id}/result"),
            Some(TOKEN),
            Some(serde_json::json!({"result": {"ok": true}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "done");

        let (status, body) = send(&app, "GET", &format!("/tasks/{id}/result"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["ok"], true);

        // A heartbeat after completion is rejected.
        let (status, body) = send(
            &app,
            "PATCH",
            &format!("/worker/tasks/{id}/heartbeat"),
            Some(TOKEN),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "CONFLICT");

        let task = engine.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn worker_status_update_sets_error() {
        let (app, engine) = make_app();
        let id = submit(&app, "https://example.com").await;
        send(&app, "POST", "/worker/tasks/next", Some(TOKEN), None).await;

        let (status, body) = send(
            &app,
            "PATCH",
            &format!("/worker/tasks/{id}/status"),
            Some(TOKEN),
            Some(serde_json::json!({"status": "failed", "error": "handler crashed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");

        let task: Task = engine.get(&id).unwrap();
        assert_eq!(task.error, "handler crashed");
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn list_endpoint_filters() {
        let (app, _engine) = make_app();
        submit(&app, "https://example.com/a").await;
        submit(&app, "https://example.com/b").await;

        let (status, body) = send(&app, "GET", "/tasks?status=new", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
    }
}
