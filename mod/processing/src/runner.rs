use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::TaskEngine;
use crate::model::{TaskStatus, Worker};
use crate::registry::{HandlerRegistry, TaskOutcome};

/// Configuration for an in-process task runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long to sleep when a claim pass comes back empty (seconds).
    pub poll_interval_secs: u64,
    /// Lease renewal cadence while a handler runs (seconds).
    pub heartbeat_interval_secs: u64,
    /// Tasks to claim per pass.
    pub batch_limit: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            heartbeat_interval_secs: 30,
            batch_limit: 5,
        }
    }
}

/// Start an in-process runner for embedders that host handlers next to
/// the scheduler instead of running separate worker processes.
///
/// The runner claims batches through the engine under the given worker
/// identity, executes the registered handler for each task's kind,
/// renews the lease on an interval while a handler runs, and reports
/// the terminal outcome. Returns a CancellationToken that stops the
/// claim loop (tasks already dispatched run to completion).
pub fn start(
    engine: Arc<TaskEngine>,
    registry: Arc<HandlerRegistry>,
    worker: Worker,
    config: RunnerConfig,
) -> CancellationToken {
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        let poll_interval = Duration::from_secs(config.poll_interval_secs.max(1));
        let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let batch_limit = config.batch_limit;

        tokio::spawn(async move {
            info!(worker = %worker.name, "task runner started");
            loop {
                if cancel.is_cancelled() {
                    info!(worker = %worker.name, "task runner stopped");
                    break;
                }

                let claimed = match engine.claim_batch(&worker, batch_limit) {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        error!("runner claim error: {e}");
                        Vec::new()
                    }
                };

                if claimed.is_empty() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(worker = %worker.name, "task runner stopped");
                            break;
                        }
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                    continue;
                }

                for task in claimed {
                    let engine = Arc::clone(&engine);
                    let registry = Arc::clone(&registry);
                    let worker = worker.clone();
                    tokio::spawn(async move {
                        run_task(engine, registry, worker, task, heartbeat_interval).await;
                    });
                }
            }
        });
    }

    cancel
}

/// Execute one claimed task: dispatch to its handler, heartbeat while it
/// runs, report the outcome.
async fn run_task(
    engine: Arc<TaskEngine>,
    registry: Arc<HandlerRegistry>,
    worker: Worker,
    task: crate::model::Task,
    heartbeat_interval: Duration,
) {
    let Some(handler) = registry.get(&task.kind) else {
        // A claimed task nobody here can run is a deployment mistake;
        // fail it loudly instead of holding the lease until expiry.
        warn!(task = %task.id, kind = %task.kind, "no handler registered");
        if let Err(e) = engine.set_status(
            &task.id,
            &worker,
            TaskStatus::Failed,
            Some(format!("no handler registered for kind '{}'", task.kind)),
        ) {
            error!(task = %task.id, "failed to report missing handler: {e}");
        }
        return;
    };

    debug!(task = %task.id, kind = %task.kind, "handler dispatched");

    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.tick().await; // first tick fires immediately; skip it

    let fut = handler.handle(&task.id, &task.payload_ref);
    tokio::pin!(fut);

    let outcome = loop {
        tokio::select! {
            outcome = &mut fut => break outcome,
            _ = ticker.tick() => {
                if let Err(e) = engine.heartbeat(&task.id, &worker, None) {
                    // Lease lost (swept or reassigned) — keep running;
                    // the terminal report below will be rejected the
                    // same way and logged once.
                    warn!(task = %task.id, "heartbeat rejected: {e}");
                }
            }
        }
    };

    let report = match outcome {
        TaskOutcome::Done { result } => engine
            .submit_result(&task.id, &worker, Some(&result), None)
            .map(|_| ()),
        TaskOutcome::Failed { error } => engine
            .set_status(&task.id, &worker, TaskStatus::Failed, Some(error))
            .map(|_| ()),
    };
    if let Err(e) = report {
        warn!(task = %task.id, "terminal report rejected: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, SubmitTaskRequest};
    use crate::registry::TaskHandler;
    use crate::store::TaskStore;
    use async_trait::async_trait;
    use siteproof_core::now_rfc3339;
    use siteproof_sql::{SqlStore, SqliteStore};

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, _task_id: &str, payload_ref: &str) -> TaskOutcome {
            TaskOutcome::Done {
                result: serde_json::json!({"analyzed": payload_ref, "score": 85.0}),
            }
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _task_id: &str, _payload_ref: &str) -> TaskOutcome {
            TaskOutcome::Failed {
                error: "extraction failed".into(),
            }
        }
    }

    fn make_engine() -> Arc<TaskEngine> {
        let db: Arc<dyn SqlStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = Arc::new(TaskStore::new(db).unwrap());
        Arc::new(TaskEngine::new(store))
    }

    fn submit(engine: &TaskEngine, kind: &str) -> crate::model::Task {
        engine
            .submit(SubmitTaskRequest {
                payload_ref: "https://example.com".into(),
                kind: Some(kind.into()),
                priority: Some(Priority::Normal),
                ttl_seconds: None,
                max_retries: None,
            })
            .unwrap()
    }

    async fn wait_for_terminal(engine: &TaskEngine, task_id: &str) -> crate::model::Task {
        for _ in 0..200 {
            let task = engine.get(task_id).unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    fn fast_config() -> RunnerConfig {
        RunnerConfig {
            poll_interval_secs: 1,
            heartbeat_interval_secs: 1,
            batch_limit: 5,
        }
    }

    #[tokio::test]
    async fn runner_completes_task_end_to_end() {
        let engine = make_engine();
        let worker = engine
            .store()
            .ensure_worker("runner", "runner-token", &now_rfc3339())
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry
            .register("website.analyze", Arc::new(OkHandler))
            .unwrap();

        let task = submit(&engine, "website.analyze");
        let cancel = start(
            Arc::clone(&engine),
            Arc::new(registry),
            worker,
            fast_config(),
        );

        let done = wait_for_terminal(&engine, &task.id).await;
        cancel.cancel();

        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.result.as_ref().unwrap()["score"], 85.0);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn runner_reports_handler_failure() {
        let engine = make_engine();
        let worker = engine
            .store()
            .ensure_worker("runner", "runner-token", &now_rfc3339())
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry
            .register("document.analyze", Arc::new(FailingHandler))
            .unwrap();

        let task = submit(&engine, "document.analyze");
        let cancel = start(
            Arc::clone(&engine),
            Arc::new(registry),
            worker,
            fast_config(),
        );

        let failed = wait_for_terminal(&engine, &task.id).await;
        cancel.cancel();

        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error, "extraction failed");
    }

    #[tokio::test]
    async fn runner_fails_tasks_with_unregistered_kind() {
        let engine = make_engine();
        let worker = engine
            .store()
            .ensure_worker("runner", "runner-token", &now_rfc3339())
            .unwrap();

        let task = submit(&engine, "pattern.detect");
        let cancel = start(
            Arc::clone(&engine),
            Arc::new(HandlerRegistry::new()),
            worker,
            fast_config(),
        );

        let failed = wait_for_terminal(&engine, &task.id).await;
        cancel.cancel();

        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error.contains("pattern.detect"));
    }
}
