use std::sync::Arc;

use tracing::debug;

use siteproof_core::{ServiceError, new_id, now_rfc3339, parse_rfc3339};

use crate::model::{
    DEFAULT_KIND, DEFAULT_MAX_RETRIES, DEFAULT_TTL_SECS, SubmitTaskRequest, Task, TaskListQuery,
    TaskStatus, Worker,
};
use crate::store::TaskStore;

/// Cap on a single batch claim.
const MAX_CLAIM_BATCH: u32 = 50;

/// The scheduling engine.
///
/// A thin, stateless layer over [`TaskStore`]: it owns the task
/// lifecycle rules (defaults, the transition table, lease
/// authorization, retry budgets) while every actual mutation is one
/// atomic conditional write in the store. Nothing is cached between
/// calls — worker processes and the sweep all see current rows.
pub struct TaskEngine {
    store: Arc<TaskStore>,
}

impl TaskEngine {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    // =======================================================================
    // Producer-facing
    // =======================================================================

    /// Create a new task in `new` status.
    pub fn submit(&self, req: SubmitTaskRequest) -> Result<Task, ServiceError> {
        if req.payload_ref.trim().is_empty() {
            return Err(ServiceError::Validation("payloadRef must not be empty".into()));
        }
        let ttl = req.ttl_seconds.unwrap_or(DEFAULT_TTL_SECS);
        if ttl < 0 {
            return Err(ServiceError::Validation("ttlSeconds must not be negative".into()));
        }
        let max_retries = req.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries < 0 {
            return Err(ServiceError::Validation("maxRetries must not be negative".into()));
        }

        let now = now_rfc3339();
        let task = Task {
            id: new_id(),
            kind: req.kind.unwrap_or_else(|| DEFAULT_KIND.to_string()),
            payload_ref: req.payload_ref,
            status: TaskStatus::New,
            priority: req.priority.unwrap_or_default(),
            ttl_seconds: ttl,
            max_retries,
            retry_count: 0,
            assigned_to: None,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
            progress: None,
            error: String::new(),
            result: None,
            result_ref: String::new(),
        };

        self.store.create(&task)?;
        Ok(task)
    }

    /// Get a single task by ID.
    pub fn get(&self, task_id: &str) -> Result<Task, ServiceError> {
        self.store.get(task_id)
    }

    /// Get a task's result. Meaningful only once done; earlier reads are
    /// rejected so producers poll status instead of a half-empty result.
    pub fn result(&self, task_id: &str) -> Result<Task, ServiceError> {
        let task = self.store.get(task_id)?;
        if task.status != TaskStatus::Done {
            return Err(ServiceError::Conflict(format!(
                "task {task_id} has no result yet (status: {})",
                task.status
            )));
        }
        Ok(task)
    }

    /// List tasks with optional filters.
    pub fn list(
        &self,
        query: &TaskListQuery,
    ) -> Result<siteproof_core::ListResult<Task>, ServiceError> {
        self.store.list(query)
    }

    // =======================================================================
    // Worker-facing
    // =======================================================================

    /// Claim the highest-priority, oldest claimable task for `worker`.
    /// `Ok(None)` means nothing is available — not an error.
    pub fn claim_one(&self, worker: &Worker) -> Result<Option<Task>, ServiceError> {
        self.store.claim_one(&worker.id, &now_rfc3339())
    }

    /// Claim up to `limit` tasks in one transaction (capped at 50).
    pub fn claim_batch(&self, worker: &Worker, limit: u32) -> Result<Vec<Task>, ServiceError> {
        let limit = limit.min(MAX_CLAIM_BATCH) as usize;
        self.store.claim_batch(&worker.id, limit, &now_rfc3339())
    }

    /// Renew the lease on a task the worker currently holds, optionally
    /// recording a progress value (stored verbatim).
    pub fn heartbeat(
        &self,
        task_id: &str,
        worker: &Worker,
        progress: Option<f64>,
    ) -> Result<Task, ServiceError> {
        let affected = self
            .store
            .heartbeat(task_id, &worker.id, progress, &now_rfc3339())?;
        if affected == 0 {
            // Distinguish "no such task" from "not yours / not running".
            let task = self.store.get(task_id)?;
            return Err(not_held(&task, worker));
        }
        self.store.get(task_id)
    }

    /// Worker-driven status transition, restricted to the lifecycle's
    /// legal edges. Used by workers that announce progress through the
    /// pipeline (queued -> in_progress) independent of heartbeats.
    pub fn set_status(
        &self,
        task_id: &str,
        worker: &Worker,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task, ServiceError> {
        let task = self.store.get(task_id)?;

        if !TaskStatus::can_transition(task.status, status) {
            return Err(ServiceError::Conflict(format!(
                "illegal transition {} -> {} for task {task_id}",
                task.status, status
            )));
        }
        if task.status == TaskStatus::InProgress && task.assigned_to.as_deref() != Some(&worker.id)
        {
            return Err(not_held(&task, worker));
        }

        let now = now_rfc3339();
        let affected = match status {
            TaskStatus::InProgress => self.store.begin_work(task_id, &worker.id, &now)?,
            TaskStatus::Queued if task.status == TaskStatus::New => {
                self.store.enqueue(task_id, &now)?
            }
            TaskStatus::Queued => self.store.release(task_id, &worker.id, &now)?,
            TaskStatus::Done | TaskStatus::Failed => {
                self.store
                    .finish(task_id, &worker.id, status, error.as_deref(), &now)?
            }
            // can_transition never admits `new` as a target.
            TaskStatus::New => 0,
        };

        if affected == 0 {
            // The row moved under us between the read and the guarded
            // write; report the conflict rather than retrying silently.
            return Err(ServiceError::Conflict(format!(
                "task {task_id} changed state concurrently"
            )));
        }

        debug!(task = task_id, from = %task.status, to = %status, "status transition");
        self.store.get(task_id)
    }

    /// Record a result reported by the holding worker; implies `done`.
    /// Explicitly reported outcomes are final — retries are reserved for
    /// lease expiry.
    pub fn submit_result(
        &self,
        task_id: &str,
        worker: &Worker,
        result: Option<&serde_json::Value>,
        result_ref: Option<&str>,
    ) -> Result<Task, ServiceError> {
        let result_json = match result {
            Some(v) => Some(
                serde_json::to_string(v).map_err(|e| ServiceError::Internal(e.to_string()))?,
            ),
            None => None,
        };

        let affected = self.store.record_result(
            task_id,
            &worker.id,
            result_json.as_deref(),
            result_ref,
            &now_rfc3339(),
        )?;
        if affected == 0 {
            let task = self.store.get(task_id)?;
            return Err(not_held(&task, worker));
        }
        self.store.get(task_id)
    }

    /// Resolve a worker token to an active worker row, recording the
    /// request in `last_seen`. Invalid tokens touch no task state.
    pub fn authenticate(&self, token: &str) -> Result<Worker, ServiceError> {
        let worker = self
            .store
            .find_worker_by_token(token)?
            .ok_or_else(|| ServiceError::Unauthorized("worker token missing or invalid".into()))?;
        self.store.touch_worker(&worker.id, &now_rfc3339())?;
        Ok(worker)
    }

    // =======================================================================
    // Sweep
    // =======================================================================

    /// One sweep pass: requeue or fail every in_progress task whose
    /// lease has expired. Returns (requeued, failed) counts.
    ///
    /// The expiry pivot is the first non-null of heartbeat_at,
    /// started_at, updated_at. The per-task conditional updates re-check
    /// status and the retry bound, so a worker finishing concurrently
    /// with the sweep always wins.
    pub fn sweep_expired(&self) -> Result<(u32, u32), ServiceError> {
        let running = self.store.running_tasks()?;
        let now = chrono::Utc::now();
        let now_str = now_rfc3339();

        let mut requeued = 0u32;
        let mut failed = 0u32;

        for task in running {
            let pivot = task
                .heartbeat_at
                .as_deref()
                .or(task.started_at.as_deref())
                .unwrap_or(task.updated_at.as_str());
            let Some(pivot) = parse_rfc3339(pivot) else {
                continue;
            };

            let ttl = if task.ttl_seconds > 0 {
                task.ttl_seconds
            } else {
                DEFAULT_TTL_SECS
            };
            if (now - pivot).num_seconds() <= ttl {
                continue;
            }

            if task.retry_count < task.max_retries {
                requeued += self.store.requeue_expired(&task.id, &now_str)? as u32;
            } else {
                failed += self.store.fail_expired(&task.id, &now_str)? as u32;
            }
        }

        Ok((requeued, failed))
    }
}

fn not_held(task: &Task, worker: &Worker) -> ServiceError {
    ServiceError::Conflict(format!(
        "task {} is not held by worker {} (status: {})",
        task.id, worker.name, task.status
    ))
}
