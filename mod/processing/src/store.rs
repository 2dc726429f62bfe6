use std::sync::Arc;

use siteproof_core::{ListResult, ServiceError, new_id};
use siteproof_sql::{Row, SqlConn, SqlError, SqlStore, Value};

use crate::model::{Priority, Task, TaskListQuery, TaskStatus, Worker};

/// SQL schema for the tasks and workers tables.
///
/// All four task indices are load-bearing: claim ordering, lease
/// authorization checks, retention queries, and the sweep scan each
/// have one serving them.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    payload_ref  TEXT NOT NULL,
    status       TEXT NOT NULL,
    priority     TEXT NOT NULL,
    ttl_seconds  INTEGER NOT NULL,
    max_retries  INTEGER NOT NULL,
    retry_count  INTEGER NOT NULL DEFAULT 0,
    assigned_to  TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    started_at   TEXT,
    finished_at  TEXT,
    heartbeat_at TEXT,
    progress     REAL,
    error        TEXT NOT NULL DEFAULT '',
    result       TEXT,
    result_ref   TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_assignment ON tasks(status, assigned_to);
CREATE INDEX IF NOT EXISTS idx_tasks_finished ON tasks(finished_at);
CREATE INDEX IF NOT EXISTS idx_tasks_sweep ON tasks(status, heartbeat_at);

CREATE TABLE IF NOT EXISTS workers (
    id        TEXT PRIMARY KEY,
    name      TEXT NOT NULL UNIQUE,
    token     TEXT NOT NULL UNIQUE,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_seen TEXT NOT NULL
);
";

const TASK_COLUMNS: &str = "id, kind, payload_ref, status, priority, ttl_seconds, \
     max_retries, retry_count, assigned_to, created_at, updated_at, started_at, \
     finished_at, heartbeat_at, progress, error, result, result_ref";

/// Claim ordering: high before normal before low, oldest first within
/// one priority. Served by idx_tasks_claim.
const PRIORITY_ORDER: &str =
    "CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 WHEN 'low' THEN 2 ELSE 3 END";

/// How many candidates a single claim pass examines before rescanning.
const CLAIM_SCAN_CHUNK: usize = 16;

/// Default error text written by the sweep on requeue.
pub const REQUEUED_AFTER_TTL: &str = "requeued after TTL";
/// Default error text written by the sweep when the retry budget is gone.
pub const RETRIES_EXHAUSTED: &str = "failed after TTL; retries exhausted";

/// Persistent storage for tasks and workers, backed by SqlStore (SQLite).
///
/// Every mutating operation here is a single conditional UPDATE (or one
/// transaction for batch claim), so a crash between calls can never
/// leave a task half-claimed.
pub struct TaskStore {
    db: Arc<dyn SqlStore>,
}

fn storage(e: SqlError) -> ServiceError {
    ServiceError::Storage(e.to_string())
}

impl TaskStore {
    /// Create a new TaskStore and initialise the schema.
    pub fn new(db: Arc<dyn SqlStore>) -> Result<Self, ServiceError> {
        // Schema is several statements; run them one at a time since the
        // store executes single statements.
        for stmt in SCHEMA.split(';') {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            db.exec(stmt, &[])
                .map_err(|e| ServiceError::Storage(format!("schema init: {e}")))?;
        }
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // Tasks — create / read
    // -----------------------------------------------------------------------

    /// Insert a new task.
    pub fn create(&self, task: &Task) -> Result<(), ServiceError> {
        let result_json = match &task.result {
            Some(v) => Value::Text(
                serde_json::to_string(v).map_err(|e| ServiceError::Internal(e.to_string()))?,
            ),
            None => Value::Null,
        };

        self.db
            .exec(
                "INSERT INTO tasks (id, kind, payload_ref, status, priority, ttl_seconds, \
                 max_retries, retry_count, assigned_to, created_at, updated_at, started_at, \
                 finished_at, heartbeat_at, progress, error, result, result_ref) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                &[
                    Value::Text(task.id.clone()),
                    Value::Text(task.kind.clone()),
                    Value::Text(task.payload_ref.clone()),
                    Value::Text(task.status.as_str().to_string()),
                    Value::Text(task.priority.as_str().to_string()),
                    Value::Integer(task.ttl_seconds),
                    Value::Integer(task.max_retries),
                    Value::Integer(task.retry_count),
                    opt_text(&task.assigned_to),
                    Value::Text(task.created_at.clone()),
                    Value::Text(task.updated_at.clone()),
                    opt_text(&task.started_at),
                    opt_text(&task.finished_at),
                    opt_text(&task.heartbeat_at),
                    match task.progress {
                        Some(p) => Value::Real(p),
                        None => Value::Null,
                    },
                    Value::Text(task.error.clone()),
                    result_json,
                    Value::Text(task.result_ref.clone()),
                ],
            )
            .map_err(storage)?;

        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, id: &str) -> Result<Task, ServiceError> {
        let rows = self
            .db
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                &[Value::Text(id.to_string())],
            )
            .map_err(storage)?;

        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("task {id} not found")))?;

        row_to_task(row)
    }

    /// List tasks with optional filters, newest first.
    pub fn list(&self, query: &TaskListQuery) -> Result<ListResult<Task>, ServiceError> {
        let limit = query.limit.unwrap_or(50);
        let offset = query.offset.unwrap_or(0);

        let mut where_clauses: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        let mut idx = 1;

        if let Some(ref s) = query.status {
            where_clauses.push(format!("status = ?{idx}"));
            params.push(Value::Text(s.clone()));
            idx += 1;
        }
        if let Some(ref k) = query.kind {
            where_clauses.push(format!("kind = ?{idx}"));
            params.push(Value::Text(k.clone()));
            idx += 1;
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) as cnt FROM tasks {where_sql}");
        let count_rows = self.db.query(&count_sql, &params).map_err(storage)?;
        let total = count_rows
            .first()
            .and_then(|r| r.get_i64("cnt"))
            .unwrap_or(0) as usize;

        let select_sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks {where_sql} \
             ORDER BY created_at DESC LIMIT ?{idx} OFFSET ?{}",
            idx + 1
        );
        let mut select_params = params;
        select_params.push(Value::Integer(limit as i64));
        select_params.push(Value::Integer(offset as i64));

        let rows = self.db.query(&select_sql, &select_params).map_err(storage)?;
        let items = rows.iter().map(row_to_task).collect::<Result<Vec<_>, _>>()?;

        Ok(ListResult { items, total })
    }

    // -----------------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------------

    /// Claim the best available task for `worker_id`.
    ///
    /// Candidates are ordered by priority then age; each is taken with a
    /// conditional UPDATE that only matches while the row is still
    /// claimable, so a row a concurrent claimer already won is skipped
    /// rather than waited on. `None` means nothing claimable remains.
    pub fn claim_one(&self, worker_id: &str, now: &str) -> Result<Option<Task>, ServiceError> {
        loop {
            let ids = candidate_ids(self.db.as_ref(), CLAIM_SCAN_CHUNK).map_err(storage)?;
            if ids.is_empty() {
                return Ok(None);
            }
            for id in &ids {
                if try_claim(self.db.as_ref(), id, worker_id, now).map_err(storage)? {
                    return Ok(Some(self.get(id)?));
                }
            }
            // Every candidate in this chunk was taken by concurrent
            // claimers between the scan and our update; rescan.
        }
    }

    /// Claim up to `limit` tasks for `worker_id` inside one transaction.
    ///
    /// Same ordering and skip discipline as [`claim_one`]; returns the
    /// claimed tasks, possibly empty, possibly fewer than `limit`.
    ///
    /// [`claim_one`]: TaskStore::claim_one
    pub fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        now: &str,
    ) -> Result<Vec<Task>, ServiceError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut claimed_ids: Vec<String> = Vec::new();
        let worker_id = worker_id.to_string();
        let now = now.to_string();

        self.db
            .transaction(&mut |tx| {
                claimed_ids.clear();
                let ids = candidate_ids(tx, limit)?;
                for id in ids {
                    if try_claim(tx, &id, &worker_id, &now)? {
                        claimed_ids.push(id);
                    }
                }
                Ok(())
            })
            .map_err(storage)?;

        claimed_ids.iter().map(|id| self.get(id)).collect()
    }

    // -----------------------------------------------------------------------
    // Lease-guarded mutations
    //
    // Each returns the affected row count; zero means the guard did not
    // match (wrong holder, wrong status, or unknown id) and nothing
    // changed. The engine turns that into NotFound / Conflict.
    // -----------------------------------------------------------------------

    /// new -> queued (external enqueue without immediate claim).
    pub fn enqueue(&self, id: &str, now: &str) -> Result<u64, ServiceError> {
        self.db
            .exec(
                "UPDATE tasks SET status = 'queued', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'new'",
                &[Value::Text(now.to_string()), Value::Text(id.to_string())],
            )
            .map_err(storage)
    }

    /// new/queued -> in_progress for a worker announcing work through
    /// the status endpoint. Identical write to a claim.
    pub fn begin_work(&self, id: &str, worker_id: &str, now: &str) -> Result<u64, ServiceError> {
        try_claim(self.db.as_ref(), id, worker_id, now).map_err(storage).map(u64::from)
    }

    /// in_progress -> queued, releasing the lease. Guarded by holder.
    pub fn release(&self, id: &str, worker_id: &str, now: &str) -> Result<u64, ServiceError> {
        self.db
            .exec(
                "UPDATE tasks SET status = 'queued', assigned_to = NULL, started_at = NULL, \
                 heartbeat_at = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'in_progress' AND assigned_to = ?3",
                &[
                    Value::Text(now.to_string()),
                    Value::Text(id.to_string()),
                    Value::Text(worker_id.to_string()),
                ],
            )
            .map_err(storage)
    }

    /// in_progress -> done/failed as reported by the holding worker.
    pub fn finish(
        &self,
        id: &str,
        worker_id: &str,
        status: TaskStatus,
        error: Option<&str>,
        now: &str,
    ) -> Result<u64, ServiceError> {
        self.db
            .exec(
                "UPDATE tasks SET status = ?1, finished_at = ?2, \
                 error = COALESCE(?3, error), updated_at = ?4 \
                 WHERE id = ?5 AND status = 'in_progress' AND assigned_to = ?6",
                &[
                    Value::Text(status.as_str().to_string()),
                    Value::Text(now.to_string()),
                    match error {
                        Some(e) => Value::Text(e.to_string()),
                        None => Value::Null,
                    },
                    Value::Text(now.to_string()),
                    Value::Text(id.to_string()),
                    Value::Text(worker_id.to_string()),
                ],
            )
            .map_err(storage)
    }

    /// Persist a result and mark the task done. Guarded by holder.
    pub fn record_result(
        &self,
        id: &str,
        worker_id: &str,
        result_json: Option<&str>,
        result_ref: Option<&str>,
        now: &str,
    ) -> Result<u64, ServiceError> {
        self.db
            .exec(
                "UPDATE tasks SET status = 'done', result = COALESCE(?1, result), \
                 result_ref = COALESCE(?2, result_ref), finished_at = ?3, updated_at = ?4 \
                 WHERE id = ?5 AND status = 'in_progress' AND assigned_to = ?6",
                &[
                    match result_json {
                        Some(r) => Value::Text(r.to_string()),
                        None => Value::Null,
                    },
                    match result_ref {
                        Some(r) => Value::Text(r.to_string()),
                        None => Value::Null,
                    },
                    Value::Text(now.to_string()),
                    Value::Text(now.to_string()),
                    Value::Text(id.to_string()),
                    Value::Text(worker_id.to_string()),
                ],
            )
            .map_err(storage)
    }

    /// Refresh the lease and optionally store a progress value, both in
    /// one conditional write guarded by holder and status.
    pub fn heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        progress: Option<f64>,
        now: &str,
    ) -> Result<u64, ServiceError> {
        self.db
            .exec(
                "UPDATE tasks SET heartbeat_at = ?1, progress = COALESCE(?2, progress), \
                 updated_at = ?3 \
                 WHERE id = ?4 AND status = 'in_progress' AND assigned_to = ?5",
                &[
                    Value::Text(now.to_string()),
                    match progress {
                        Some(p) => Value::Real(p),
                        None => Value::Null,
                    },
                    Value::Text(now.to_string()),
                    Value::Text(id.to_string()),
                    Value::Text(worker_id.to_string()),
                ],
            )
            .map_err(storage)
    }

    // -----------------------------------------------------------------------
    // Sweep
    // -----------------------------------------------------------------------

    /// Fetch all in_progress tasks (sweep scan, served by idx_tasks_sweep).
    pub fn running_tasks(&self) -> Result<Vec<Task>, ServiceError> {
        let rows = self
            .db
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'in_progress'"),
                &[],
            )
            .map_err(storage)?;

        rows.iter().map(row_to_task).collect()
    }

    /// Push an expired task back to the queue, spending one retry.
    ///
    /// The WHERE clause re-checks both the status and the retry bound,
    /// so a task finished (or failed) between the scan and this write is
    /// left alone and `retry_count` can never pass `max_retries`.
    pub fn requeue_expired(&self, id: &str, now: &str) -> Result<u64, ServiceError> {
        self.db
            .exec(
                "UPDATE tasks SET status = 'queued', assigned_to = NULL, started_at = NULL, \
                 heartbeat_at = NULL, retry_count = retry_count + 1, \
                 error = CASE WHEN error = '' THEN ?1 ELSE error END, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'in_progress' AND retry_count < max_retries",
                &[
                    Value::Text(REQUEUED_AFTER_TTL.to_string()),
                    Value::Text(now.to_string()),
                    Value::Text(id.to_string()),
                ],
            )
            .map_err(storage)
    }

    /// Fail an expired task whose retry budget is spent.
    pub fn fail_expired(&self, id: &str, now: &str) -> Result<u64, ServiceError> {
        self.db
            .exec(
                "UPDATE tasks SET status = 'failed', finished_at = ?1, \
                 error = CASE WHEN error = '' THEN ?2 ELSE error END, updated_at = ?3 \
                 WHERE id = ?4 AND status = 'in_progress' AND retry_count >= max_retries",
                &[
                    Value::Text(now.to_string()),
                    Value::Text(RETRIES_EXHAUSTED.to_string()),
                    Value::Text(now.to_string()),
                    Value::Text(id.to_string()),
                ],
            )
            .map_err(storage)
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    /// Create or refresh a worker by name, reactivating it and replacing
    /// its token. Returns the stored row.
    pub fn ensure_worker(&self, name: &str, token: &str, now: &str) -> Result<Worker, ServiceError> {
        self.db
            .exec(
                "INSERT INTO workers (id, name, token, is_active, last_seen) \
                 VALUES (?1, ?2, ?3, 1, ?4) \
                 ON CONFLICT(name) DO UPDATE SET token = excluded.token, is_active = 1",
                &[
                    Value::Text(new_id()),
                    Value::Text(name.to_string()),
                    Value::Text(token.to_string()),
                    Value::Text(now.to_string()),
                ],
            )
            .map_err(storage)?;

        let rows = self
            .db
            .query(
                "SELECT id, name, token, is_active, last_seen FROM workers WHERE name = ?1",
                &[Value::Text(name.to_string())],
            )
            .map_err(storage)?;
        let row = rows
            .first()
            .ok_or_else(|| ServiceError::Storage(format!("worker {name} missing after upsert")))?;
        row_to_worker(row)
    }

    /// Resolve an active worker by its secret token.
    pub fn find_worker_by_token(&self, token: &str) -> Result<Option<Worker>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, name, token, is_active, last_seen FROM workers \
                 WHERE token = ?1 AND is_active = 1",
                &[Value::Text(token.to_string())],
            )
            .map_err(storage)?;

        match rows.first() {
            Some(row) => Ok(Some(row_to_worker(row)?)),
            None => Ok(None),
        }
    }

    /// Record a successful authenticated request from a worker.
    pub fn touch_worker(&self, id: &str, now: &str) -> Result<(), ServiceError> {
        self.db
            .exec(
                "UPDATE workers SET last_seen = ?1 WHERE id = ?2",
                &[Value::Text(now.to_string()), Value::Text(id.to_string())],
            )
            .map_err(storage)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Claim internals, shared by the direct path and the batch transaction
// ---------------------------------------------------------------------------

fn candidate_ids<C: SqlConn + ?Sized>(conn: &C, limit: usize) -> Result<Vec<String>, SqlError> {
    let rows = conn.query(
        &format!(
            "SELECT id FROM tasks WHERE status IN ('new', 'queued') \
             ORDER BY {PRIORITY_ORDER}, created_at LIMIT ?1"
        ),
        &[Value::Integer(limit as i64)],
    )?;
    Ok(rows
        .iter()
        .filter_map(|r| r.get_str("id").map(str::to_string))
        .collect())
}

/// The claim write: only matches while the row is still claimable, so
/// it doubles as the skip test under contention.
fn try_claim<C: SqlConn + ?Sized>(
    conn: &C,
    id: &str,
    worker_id: &str,
    now: &str,
) -> Result<bool, SqlError> {
    let affected = conn.exec(
        "UPDATE tasks SET status = 'in_progress', assigned_to = ?1, started_at = ?2, \
         heartbeat_at = ?3, updated_at = ?4 \
         WHERE id = ?5 AND status IN ('new', 'queued')",
        &[
            Value::Text(worker_id.to_string()),
            Value::Text(now.to_string()),
            Value::Text(now.to_string()),
            Value::Text(now.to_string()),
            Value::Text(id.to_string()),
        ],
    )?;
    Ok(affected > 0)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn opt_text(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn require_str(row: &Row, name: &str) -> Result<String, ServiceError> {
    row.get_str(name)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::Storage(format!("missing column {name}")))
}

fn row_to_task(row: &Row) -> Result<Task, ServiceError> {
    let status_str = require_str(row, "status")?;
    let status = TaskStatus::from_str(&status_str)
        .ok_or_else(|| ServiceError::Storage(format!("bad task status: {status_str}")))?;

    let priority_str = require_str(row, "priority")?;
    let priority = Priority::from_str(&priority_str)
        .ok_or_else(|| ServiceError::Storage(format!("bad task priority: {priority_str}")))?;

    let result = match row.get_str("result") {
        Some(s) if !s.is_empty() => Some(
            serde_json::from_str(s)
                .map_err(|e| ServiceError::Storage(format!("bad result json: {e}")))?,
        ),
        _ => None,
    };

    Ok(Task {
        id: require_str(row, "id")?,
        kind: require_str(row, "kind")?,
        payload_ref: require_str(row, "payload_ref")?,
        status,
        priority,
        ttl_seconds: row.get_i64("ttl_seconds").unwrap_or(0),
        max_retries: row.get_i64("max_retries").unwrap_or(0),
        retry_count: row.get_i64("retry_count").unwrap_or(0),
        assigned_to: row.get_str("assigned_to").map(str::to_string),
        created_at: require_str(row, "created_at")?,
        updated_at: require_str(row, "updated_at")?,
        started_at: row.get_str("started_at").map(str::to_string),
        finished_at: row.get_str("finished_at").map(str::to_string),
        heartbeat_at: row.get_str("heartbeat_at").map(str::to_string),
        progress: row.get_f64("progress"),
        error: row.get_str("error").unwrap_or_default().to_string(),
        result,
        result_ref: row.get_str("result_ref").unwrap_or_default().to_string(),
    })
}

fn row_to_worker(row: &Row) -> Result<Worker, ServiceError> {
    Ok(Worker {
        id: require_str(row, "id")?,
        name: require_str(row, "name")?,
        token: require_str(row, "token")?,
        is_active: row.get_i64("is_active").unwrap_or(0) != 0,
        last_seen: require_str(row, "last_seen")?,
    })
}
