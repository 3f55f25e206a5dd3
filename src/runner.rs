//! Replication Runner
//!
//! Repeats replication runs until shutdown. Each run executes under the
//! task sweeper's watchdog so a stalled run is abandoned (and rolls itself
//! back) instead of blocking the loop, and a background ticker keeps the
//! heartbeat file fresh between runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::db::Session;
use crate::error::{Error, Result};
use crate::heartbeat::Heartbeat;
use crate::replication::ReplicationRun;
use crate::sweeper::TaskSweeper;

/// The replication daemon loop
pub struct ReplicationRunner {
    session: Session,
    heartbeat: Arc<Heartbeat>,
    shutdown: Arc<AtomicBool>,
}

impl ReplicationRunner {
    pub fn new(session: Session) -> Self {
        let heartbeat = Arc::new(Heartbeat::new(
            session.config().replication.heartbeat_file.clone(),
        ));
        Self {
            session,
            heartbeat,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that stops the loop when set
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Request shutdown on ctrl-c
    pub fn install_signal_handler(&self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Shutdown requested");
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| Error::Internal(format!("Failed to install signal handler: {e}")))
    }

    /// Execute a single supervised replication run. Returns whether the
    /// watchdog abandoned it.
    pub async fn run_once(&self) -> Result<bool> {
        let session = self.session.clone();
        let heartbeat = self.heartbeat.clone();
        let swept = TaskSweeper::timeout(self.session.config().run_timeout(), move |sweeper| {
            async move {
                ReplicationRun::new(session, sweeper, heartbeat)
                    .run()
                    .await
            }
        })
        .await?;
        Ok(swept.terminated())
    }

    /// Run replication repeatedly until the shutdown flag is set
    pub async fn run(&self) -> Result<()> {
        let ticker = self.spawn_heartbeat_ticker();
        tracing::info!("Replication loop started");

        let result = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }
            match self.run_once().await {
                Ok(true) => {
                    tracing::warn!("Replication run timed out and was rolled back");
                }
                Ok(false) => {}
                // Configuration problems will not fix themselves; stop
                Err(e @ Error::Config(_)) => break Err(e),
                Err(e) => {
                    tracing::error!("Replication run failed: {}", e);
                }
            }
            self.wait_for_next_run().await;
        };

        ticker.abort();
        tracing::info!("Replication loop stopped");
        result
    }

    fn spawn_heartbeat_ticker(&self) -> tokio::task::JoinHandle<()> {
        let heartbeat = self.heartbeat.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.session.config().run_interval().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                heartbeat.ping().await;
            }
        })
    }

    /// Sleep until the next run, waking early on shutdown
    async fn wait_for_next_run(&self) {
        let interval = self.session.config().run_interval();
        let step = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < interval {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let remaining = interval - waited;
            tokio::time::sleep(step.min(remaining)).await;
            waited += step;
        }
    }
}
