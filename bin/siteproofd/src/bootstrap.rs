//! Bootstrap — first-start checks and the default worker row.
//!
//! When siteproofd starts:
//! 1. Verify the storage configuration points somewhere usable.
//! 2. If a bootstrap token is configured, upsert the `default-worker`
//!    row with it so a single pre-shared secret is enough to bring the
//!    first worker online.

use siteproof_core::now_rfc3339;
use siteproof_processing::store::TaskStore;
use tracing::{info, warn};

use crate::config::ServerConfig;

/// Name of the worker row created from the bootstrap token.
pub const BOOTSTRAP_WORKER_NAME: &str = "default-worker";

/// Verify server configuration is ready for use.
pub fn verify_config(config: &ServerConfig) -> anyhow::Result<()> {
    if config.storage.data_dir.is_empty() {
        anyhow::bail!("Storage data_dir is empty in configuration.");
    }
    if config.sweep.interval_secs == 0 {
        anyhow::bail!("Sweep interval must be at least 1 second.");
    }
    Ok(())
}

/// Create or refresh the default worker from the configured token.
///
/// The WORKER_BOOTSTRAP_TOKEN environment variable wins over the config
/// file; with neither set this is a no-op with a warning, matching a
/// deployment that registers workers out of band.
pub fn ensure_bootstrap_worker(
    store: &TaskStore,
    config: &ServerConfig,
) -> anyhow::Result<()> {
    let token = std::env::var("WORKER_BOOTSTRAP_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
        .or_else(|| config.worker.bootstrap_token.clone());

    let Some(token) = token else {
        warn!("no worker bootstrap token set; skipping default worker");
        return Ok(());
    };

    let worker = store
        .ensure_worker(BOOTSTRAP_WORKER_NAME, &token, &now_rfc3339())
        .map_err(|e| anyhow::anyhow!("failed to bootstrap worker: {e}"))?;
    info!("worker ready: {}", worker.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use siteproof_sql::{SqlStore, SqliteStore};

    fn test_store() -> TaskStore {
        let db: Arc<dyn SqlStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        TaskStore::new(db).unwrap()
    }

    #[test]
    fn verify_config_rejects_empty_data_dir() {
        let mut config = ServerConfig::default();
        config.storage.data_dir = String::new();
        assert!(verify_config(&config).is_err());
    }

    #[test]
    fn verify_config_rejects_zero_interval() {
        let mut config = ServerConfig::default();
        config.sweep.interval_secs = 0;
        assert!(verify_config(&config).is_err());
    }

    #[test]
    fn bootstrap_creates_worker_from_config_token() {
        let store = test_store();
        let mut config = ServerConfig::default();
        config.worker.bootstrap_token = Some("boot-token".into());

        ensure_bootstrap_worker(&store, &config).unwrap();

        let worker = store.find_worker_by_token("boot-token").unwrap().unwrap();
        assert_eq!(worker.name, BOOTSTRAP_WORKER_NAME);
        assert!(worker.is_active);
    }

    #[test]
    fn bootstrap_without_token_is_a_noop() {
        let store = test_store();
        let config = ServerConfig::default();
        ensure_bootstrap_worker(&store, &config).unwrap();
        assert!(store.find_worker_by_token("anything").unwrap().is_none());
    }

    #[test]
    fn bootstrap_replaces_token_on_rerun() {
        let store = test_store();
        let mut config = ServerConfig::default();
        config.worker.bootstrap_token = Some("first".into());
        ensure_bootstrap_worker(&store, &config).unwrap();

        config.worker.bootstrap_token = Some("second".into());
        ensure_bootstrap_worker(&store, &config).unwrap();

        assert!(store.find_worker_by_token("first").unwrap().is_none());
        assert!(store.find_worker_by_token("second").unwrap().is_some());
    }
}
