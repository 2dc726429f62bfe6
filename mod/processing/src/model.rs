use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// ```text
/// new ──────→ in_progress ──→ done
///   └→ queued ──↗        ╲──→ failed
///        ↑────────────────┘   (sweep requeue, budget remaining)
/// ```
///
/// `done` and `failed` are terminal — no edge ever leaves them. A task
/// whose worker stops heartbeating is pushed back to `queued` by the
/// sweep until its retry budget runs out, then marked `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Queued,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether a task in this state may be claimed by a worker.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::New | Self::Queued)
    }

    /// The complete transition table. Everything not listed here is an
    /// illegal edge and is rejected wherever a status gets written.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (New, Queued)
                | (New, InProgress)
                | (Queued, InProgress)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Queued)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Claim-ordering priority. `high` beats `normal` beats `low`; within
/// one priority the oldest task wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task — the core data model, maps 1:1 to SQL columns
// ---------------------------------------------------------------------------

/// Default handler kind when the producer does not declare one.
pub const DEFAULT_KIND: &str = "website.analyze";

/// Default lease budget in seconds, also applied at sweep time when a
/// row carries a non-positive ttl.
pub const DEFAULT_TTL_SECS: i64 = 3600;

/// Default retry budget.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// A single analysis task tracked by the processing module.
///
/// All fields map directly to SQL columns — no JSON blob. The payload
/// reference and result are opaque to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    // --- definition ---
    /// Declared handler kind, resolved through the handler registry on
    /// whatever runs the task.
    pub kind: String,
    /// Opaque reference to the work item (URL, document key, ...).
    pub payload_ref: String,

    // --- scheduling ---
    pub status: TaskStatus,
    pub priority: Priority,
    /// Lease duration budget in seconds.
    pub ttl_seconds: i64,
    /// How many times this task may be re-queued after lease expiry.
    pub max_retries: i64,
    /// How many times it has been re-queued so far.
    pub retry_count: i64,

    // --- lease ---
    /// Worker currently holding the lease (non-null while in_progress;
    /// terminal rows keep the worker that reported the outcome).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,

    // --- timestamps ---
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<String>,

    // --- reporting ---
    /// Caller-supplied progress indicator, stored verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Last-failure reason; empty when none.
    #[serde(default)]
    pub error: String,
    /// Opaque result payload, set on done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Opaque reference to an externally-stored result, empty when unset.
    #[serde(default)]
    pub result_ref: String,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// An authenticated worker allowed to claim tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: String,
    pub name: String,
    /// Bearer secret. Never serialized into API responses.
    #[serde(skip_serializing)]
    pub token: String,
    pub is_active: bool,
    pub last_seen: String,
}

// ---------------------------------------------------------------------------
// API request types — producer-facing
// ---------------------------------------------------------------------------

/// Body for `POST /tasks/submit`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    /// Opaque reference to the work item.
    pub payload_ref: String,

    /// Handler kind; defaults to [`DEFAULT_KIND`].
    #[serde(default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub priority: Option<Priority>,

    #[serde(default)]
    pub ttl_seconds: Option<i64>,

    #[serde(default)]
    pub max_retries: Option<i64>,
}

/// Query parameters for `GET /tasks`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListQuery {
    #[serde(default)]
    pub limit: Option<usize>,

    #[serde(default)]
    pub offset: Option<usize>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub kind: Option<String>,
}

/// Response for `GET /tasks/{id}/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub id: String,
    pub kind: String,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub error: String,
}

impl From<&Task> for TaskStatusResponse {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind.clone(),
            status: task.status,
            priority: task.priority,
            progress: task.progress,
            created_at: task.created_at.clone(),
            updated_at: task.updated_at.clone(),
            started_at: task.started_at.clone(),
            finished_at: task.finished_at.clone(),
            error: task.error.clone(),
        }
    }
}

/// Response for `GET /tasks/{id}/result`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub result_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl From<&Task> for TaskResultResponse {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            result: task.result.clone(),
            result_ref: task.result_ref.clone(),
            finished_at: task.finished_at.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// API request types — worker-facing
// ---------------------------------------------------------------------------

/// Body for `POST /worker/tasks/next_batch`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBatchRequest {
    /// Max tasks to claim in one call (default 5, capped at 50).
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Body for `PATCH /worker/tasks/{id}/status`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Body for `PATCH /worker/tasks/{id}/heartbeat`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub progress: Option<f64>,
}

/// Body for `POST /worker/tasks/{id}/result`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRequest {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub result_ref: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
