//! Task Sweeper
//!
//! Cooperative watchdog for a replication run. The run pings the sweeper as
//! it makes progress; if the pings stop for longer than the timeout, the
//! sweeper marks itself terminated and `timeout` returns early. The
//! abandoned task keeps running in the background and is expected to notice
//! `terminated()` at its next check point, roll back, and exit cleanly.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Shared progress/termination state between a run and its watchdog
#[derive(Debug)]
pub struct TaskSweeper {
    timeout: Duration,
    last_ping: Mutex<Instant>,
    terminated: AtomicBool,
}

impl TaskSweeper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_ping: Mutex::new(Instant::now()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Signal that the task is still making progress
    pub fn ping(&self) {
        if let Ok(mut last_ping) = self.last_ping.lock() {
            *last_ping = Instant::now();
        }
    }

    /// Whether the watchdog has given up on the task
    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Mark the task as terminated (watchdog or external shutdown)
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn stalled(&self) -> bool {
        self.last_ping
            .lock()
            .map(|last_ping| last_ping.elapsed() > self.timeout)
            .unwrap_or(true)
    }

    /// Run a task under watchdog supervision.
    ///
    /// Returns when the task completes (propagating its result) or when it
    /// stalls past the timeout, whichever comes first. On a stall the task
    /// is left running detached; `SweptTask::join` can still await it.
    pub async fn timeout<F, Fut>(timeout: Duration, task: F) -> Result<SweptTask>
    where
        F: FnOnce(Arc<TaskSweeper>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let sweeper = Arc::new(TaskSweeper::new(timeout));
        let mut handle = tokio::spawn(task(sweeper.clone()));

        let check_interval = (timeout / 10).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(check_interval);

        loop {
            tokio::select! {
                joined = &mut handle => {
                    joined.map_err(|e| {
                        Error::Internal(format!("supervised task failed: {e}"))
                    })??;
                    return Ok(SweptTask {
                        sweeper,
                        handle: None,
                    });
                }
                _ = ticker.tick() => {
                    if sweeper.stalled() {
                        sweeper.terminate();
                        tracing::warn!(
                            timeout_secs = timeout.as_secs_f64(),
                            "task stalled past its timeout, abandoning it"
                        );
                        return Ok(SweptTask {
                            sweeper,
                            handle: Some(handle),
                        });
                    }
                }
            }
        }
    }
}

/// Outcome handle of a supervised task
#[derive(Debug)]
pub struct SweptTask {
    sweeper: Arc<TaskSweeper>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl SweptTask {
    /// Whether the task was abandoned by the watchdog
    pub fn terminated(&self) -> bool {
        self.sweeper.terminated()
    }

    /// Await the task even after the watchdog gave up on it
    pub async fn join(self) -> Result<()> {
        match self.handle {
            None => Ok(()),
            Some(handle) => handle
                .await
                .map_err(|e| Error::Internal(format!("supervised task failed: {e}")))?,
        }
    }
}
