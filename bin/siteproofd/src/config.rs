//! Server configuration, loaded from a TOML file with CLI overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sweep: SweepSection,

    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding all persistent state.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepSection {
    /// How often the lease sweep scans for expired tasks (seconds).
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerSection {
    /// Token for the bootstrap worker row; the WORKER_BOOTSTRAP_TOKEN
    /// environment variable takes precedence.
    #[serde(default)]
    pub bootstrap_token: Option<String>,
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        let config = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("cannot parse config {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }
}
