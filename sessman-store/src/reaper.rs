//! Background sweep of expired sessions
//!
//! One reaper runs per physical store. It holds only a weak reference to the
//! store, so dropping every backend handle also ends the task.

use crate::errors::{SessionError, SessionResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// A store the reaper can sweep
#[async_trait]
pub trait Sweeper: Send + Sync + 'static {
    /// Delete expired records under the store's lock, returning how many went
    async fn sweep(&self) -> SessionResult<u64>;

    /// Called once when the reaper gives up
    fn on_reaper_failure(&self, failure: &SessionError);
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Label used in logs
    pub name: String,
    pub interval: Duration,
    /// Consecutive failed sweeps tolerated before the reaper terminates
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaperStatus {
    Running,
    Stopped,
    Failed {
        consecutive_failures: u32,
        message: String,
    },
}

#[derive(Debug)]
struct ReaperState {
    status: Mutex<ReaperStatus>,
    sweeps: AtomicU64,
    rows_deleted: AtomicU64,
}

impl ReaperState {
    fn set_status(&self, status: ReaperStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }
}

/// Handle to a running reaper
///
/// Dropping the handle also stops the task.
#[derive(Debug)]
pub struct ReaperHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    state: Arc<ReaperState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReaperHandle {
    /// Spawn the sweep loop on the current runtime
    pub fn spawn<S: Sweeper>(target: Weak<S>, config: ReaperConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = Arc::new(ReaperState {
            status: Mutex::new(ReaperStatus::Running),
            sweeps: AtomicU64::new(0),
            rows_deleted: AtomicU64::new(0),
        });

        info!(
            reaper = %config.name,
            interval_secs = config.interval.as_secs_f64(),
            "Starting session reaper"
        );

        let name = config.name.clone();
        let task = tokio::spawn(run(target, config, stop_rx, Arc::clone(&state)));

        Self {
            name,
            stop_tx,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Ask the loop to exit at its next wake-up
    pub fn stop(&self) {
        if self.stop_tx.send(true).is_ok() {
            debug!(reaper = %self.name, "Stop requested");
        }
    }

    /// Stop and wait for the task to finish its current sweep
    pub async fn stop_and_wait(&self) {
        self.stop();
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(reaper = %self.name, error = %e, "Reaper task ended abnormally");
            }
        }
    }

    pub fn status(&self) -> ReaperStatus {
        self.state
            .status
            .lock()
            .map(|status| status.clone())
            .unwrap_or(ReaperStatus::Stopped)
    }

    pub fn is_running(&self) -> bool {
        self.status() == ReaperStatus::Running
    }

    /// Completed sweeps so far
    pub fn sweeps(&self) -> u64 {
        self.state.sweeps.load(Ordering::SeqCst)
    }

    /// Rows removed across all sweeps
    pub fn rows_deleted(&self) -> u64 {
        self.state.rows_deleted.load(Ordering::SeqCst)
    }
}

async fn run<S: Sweeper>(
    target: Weak<S>,
    config: ReaperConfig,
    mut stop_rx: watch::Receiver<bool>,
    state: Arc<ReaperState>,
) {
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                // Err means the handle was dropped
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = interval.tick() => {}
        }

        let Some(store) = target.upgrade() else {
            debug!(reaper = %config.name, "Store dropped, reaper exiting");
            break;
        };

        match store.sweep().await {
            Ok(deleted) => {
                consecutive_failures = 0;
                state.sweeps.fetch_add(1, Ordering::SeqCst);
                state.rows_deleted.fetch_add(deleted, Ordering::SeqCst);
                if deleted > 0 {
                    info!(reaper = %config.name, deleted = deleted, "Swept expired sessions");
                } else {
                    debug!(reaper = %config.name, "Sweep found nothing to delete");
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    reaper = %config.name,
                    error = %e,
                    consecutive_failures = consecutive_failures,
                    "Sweep failed"
                );

                if consecutive_failures > config.max_consecutive_failures {
                    let failure = SessionError::ReaperFailure {
                        message: e.to_string(),
                        consecutive_failures,
                    };
                    error!(reaper = %config.name, error = %failure, "Reaper terminating");
                    store.on_reaper_failure(&failure);
                    state.set_status(ReaperStatus::Failed {
                        consecutive_failures,
                        message: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    info!(reaper = %config.name, "Session reaper stopped");
    state.set_status(ReaperStatus::Stopped);
}
