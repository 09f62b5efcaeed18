//! Expired backend sweeper
//!
//! Periodically removes backends whose TTL has passed so their breakers,
//! cached connections and sessions are released, not just skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::proxy::Orchestrator;

/// Default time between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Background task clearing expired backends from an orchestrator
pub struct ExpirySweeper {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn spawn(self) -> ExpirySweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        ExpirySweeperHandle { shutdown_tx, task }
    }

    /// Run until shutdown is signalled
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting expiry sweeper with {}s interval",
            self.interval.as_secs_f64()
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Expiry sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass; returns how many backends were removed
    pub fn sweep(&self) -> usize {
        let removed = self.orchestrator.clear_expired();
        if removed > 0 {
            info!(removed, "Swept expired proxy backends");
        } else {
            debug!("No expired proxy backends");
        }
        removed
    }
}

/// Handle to a running sweeper
pub struct ExpirySweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ExpirySweeperHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait up to `timeout`; the task is aborted when it overruns
    pub async fn stop(self, timeout: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Expiry sweeper did not stop within {:?}, aborting", timeout);
                task.abort();
                false
            }
        }
    }
}
