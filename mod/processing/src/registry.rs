use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use siteproof_core::ServiceError;

/// Terminal outcome reported by a handler.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The handler produced a result payload.
    Done { result: serde_json::Value },
    /// The handler ran and decided it cannot succeed. Explicit failures
    /// are final — they are never retried automatically.
    Failed { error: String },
}

/// The contract a task handler fulfils: given a task identifier and its
/// opaque payload reference, eventually report a terminal outcome.
///
/// Handler internals (document extraction, LLM pipelines, browser
/// automation) are invisible to the scheduler.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task_id: &str, payload_ref: &str) -> TaskOutcome;
}

/// Maps a declared task kind to its handler.
///
/// Populated once at startup; dispatch is an explicit lookup, never
/// reflection or dynamic loading.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a kind. Double registration is a wiring
    /// mistake and is rejected.
    pub fn register(
        &mut self,
        kind: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), ServiceError> {
        if self.handlers.contains_key(kind) {
            return Err(ServiceError::Conflict(format!(
                "handler for kind '{kind}' already registered"
            )));
        }
        self.handlers.insert(kind.to_string(), handler);
        Ok(())
    }

    /// Look up the handler for a kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// All registered kinds.
    pub fn kinds(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}
