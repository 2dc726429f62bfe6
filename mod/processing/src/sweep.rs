use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::TaskEngine;

/// Configuration for the background sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often to scan for expired leases (seconds).
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

/// Start the background sweep loop.
///
/// Every interval it scans in_progress tasks and requeues those whose
/// lease expired while retry budget remains, failing the rest. Returns
/// a CancellationToken that stops the loop when cancelled.
pub fn start(engine: Arc<TaskEngine>, config: SweepConfig) -> CancellationToken {
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        let interval = Duration::from_secs(config.interval_secs.max(1));

        tokio::spawn(async move {
            info!("lease sweep started (interval={interval:?})");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("lease sweep stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        debug!("sweep scan");
                        match engine.sweep_expired() {
                            Ok((0, 0)) => {}
                            Ok((requeued, failed)) => {
                                info!("sweep: requeued {requeued}, failed {failed} expired tasks");
                            }
                            Err(e) => error!("sweep error: {e}"),
                        }
                    }
                }
            }
        });
    }

    cancel
}
