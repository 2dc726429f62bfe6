pub mod api;
pub mod engine;
pub mod middleware;
pub mod model;
pub mod registry;
pub mod runner;
pub mod store;
pub mod sweep;

use std::sync::Arc;

use axum::Router;

use siteproof_core::Module;
use siteproof_sql::SqlStore;

use engine::TaskEngine;
use store::TaskStore;
use sweep::SweepConfig;

/// The processing module — task-leasing scheduler for analysis jobs.
///
/// Embed this in a service to get producer submission/status/result
/// endpoints, worker claim/heartbeat/result endpoints behind token
/// auth, and the background sweep that recovers tasks whose worker
/// disappeared.
pub struct ProcessingModule {
    engine: Arc<TaskEngine>,
    _sweep_cancel: tokio_util::sync::CancellationToken,
}

impl ProcessingModule {
    /// Create the module, initialise storage, and start the sweep.
    pub fn new(db: Arc<dyn SqlStore>) -> Result<Self, siteproof_core::ServiceError> {
        Self::with_config(db, SweepConfig::default())
    }

    /// Create with explicit sweep configuration.
    pub fn with_config(
        db: Arc<dyn SqlStore>,
        sweep_config: SweepConfig,
    ) -> Result<Self, siteproof_core::ServiceError> {
        let store = Arc::new(TaskStore::new(db)?);
        let engine = Arc::new(TaskEngine::new(store));
        let cancel = sweep::start(Arc::clone(&engine), sweep_config);

        Ok(Self {
            engine,
            _sweep_cancel: cancel,
        })
    }

    /// Get a reference to the TaskEngine for bootstrap and embedding.
    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }
}

impl Module for ProcessingModule {
    fn name(&self) -> &str {
        "processing"
    }

    fn routes(&self) -> Router {
        api::router(Arc::clone(&self.engine))
    }
}
