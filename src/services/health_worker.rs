//! Per-source health probing loop
//!
//! Each worker owns one source label: on every tick it asks the checker
//! which of that source's backends are due and probes them concurrently.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::proxy::health::{HealthAction, HealthChecker};

/// Background prober for the backends of one source
pub struct HealthWorker {
    checker: Arc<HealthChecker>,
    source: String,
    interval: Duration,
    concurrency: usize,
}

impl HealthWorker {
    pub fn new(
        checker: Arc<HealthChecker>,
        source: impl Into<String>,
        interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            checker,
            source: source.into(),
            interval,
            concurrency: concurrency.max(1),
        }
    }

    /// Start the loop on the runtime
    pub fn spawn(self) -> HealthWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let source = self.source.clone();
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        HealthWorkerHandle {
            source,
            shutdown_tx,
            task,
        }
    }

    /// Run until shutdown is signalled
    #[instrument(skip(self, shutdown), fields(source = %self.source))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health worker with {}s interval",
            self.interval.as_secs_f64()
        );

        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health worker shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // A cycle can be long; shutdown still interrupts it
                    tokio::select! {
                        _ = self.run_cycle() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!("Health worker shutting down mid-cycle");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Probe every due backend of this source once
    pub async fn run_cycle(&self) -> usize {
        let due = self
            .checker
            .due_backends(&self.source, Instant::now());
        if due.is_empty() {
            return 0;
        }
        debug!(source = %self.source, count = due.len(), "Probing due backends");

        futures::stream::iter(due)
            .map(|(id, action)| {
                let checker = self.checker.clone();
                async move {
                    let probe = async {
                        match action {
                            HealthAction::Check => checker.check_and_update(&id).await,
                            HealthAction::Recover => checker.attempt_recovery(&id).await,
                        }
                    };
                    match AssertUnwindSafe(probe).catch_unwind().await {
                        Ok(Ok(_)) => true,
                        Ok(Err(e)) => {
                            // Usually the backend was removed mid-cycle
                            debug!(backend = %id, "Health check skipped: {}", e);
                            false
                        }
                        Err(_) => {
                            error!(backend = %id, "Health check panicked");
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await
    }
}

/// Handle for stopping a running [`HealthWorker`]
pub struct HealthWorkerHandle {
    source: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthWorkerHandle {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait up to `timeout` for the loop to exit
    ///
    /// A worker that overruns the timeout is aborted; returns whether it
    /// exited on its own.
    pub async fn stop(self, timeout: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);

        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(source = %self.source, "Health worker task failed: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    source = %self.source,
                    "Health worker did not stop within {:?}, aborting",
                    timeout
                );
                task.abort();
                false
            }
        }
    }
}
