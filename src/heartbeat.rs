//! Heartbeat
//!
//! Liveness signal for external supervision: every ping rewrites a small
//! JSON file with the process id and current timestamp. A process manager or
//! monitoring script watches the file's age to decide whether the
//! replication daemon is still alive.

use std::path::PathBuf;

/// Liveness file pinger. Without a configured file, pings only trace.
pub struct Heartbeat {
    file: Option<PathBuf>,
}

impl Heartbeat {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self { file }
    }

    /// Record one liveness signal
    pub async fn ping(&self) {
        tracing::trace!("heartbeat");
        let Some(path) = &self.file else {
            return;
        };
        let payload = serde_json::json!({
            "pid": std::process::id(),
            "updated_at": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = tokio::fs::write(path, payload.to_string()).await {
            tracing::warn!("Failed to write heartbeat file {:?}: {}", path, e);
        }
    }
}
