//! Replication Helper
//!
//! Mediates all record I/O and outcome logging for the replicator. Reads go
//! straight to the databases; writes are funneled through the committer so
//! transaction buffering stays in one place.

use chrono::Utc;

use crate::change::RecordKey;
use crate::committer::{BufferedCommitter, Committer};
use crate::config::TableOptions;
use crate::db::{EventLogEntry, Row, Session, Side};
use crate::error::Result;

use super::difference::ReplicationDifference;

/// Maximum length of the event log `description` column
const DESCRIPTION_SIZE: usize = 255;
/// Maximum length of the event log `long_description` column
const LONG_DESCRIPTION_SIZE: usize = 4000;

/// Record I/O and outcome logging on behalf of the replicator
pub struct ReplicationHelper {
    session: Session,
    committer: Box<dyn Committer>,
}

impl ReplicationHelper {
    /// Create a helper with the default buffered committer. Opens the
    /// transaction pair.
    pub async fn new(session: Session) -> Result<Self> {
        let committer = Box::new(BufferedCommitter::new(session.clone()).await?);
        Ok(Self { session, committer })
    }

    /// Create a helper over an externally supplied committer
    pub fn with_committer(session: Session, committer: Box<dyn Committer>) -> Self {
        Self { session, committer }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Effective options for the given table
    pub fn options_for_table(&self, table: &str) -> TableOptions {
        self.session.config().options_for_table(table)
    }

    /// The configured key separator
    pub fn key_sep(&self) -> &str {
        &self.session.config().replication.key_sep
    }

    /// Load the current row for a key directly from the given database
    pub async fn load_record(
        &self,
        side: Side,
        table: &str,
        key: &RecordKey,
    ) -> Result<Option<Row>> {
        self.session.db(side).load_record(table, key).await
    }

    /// Insert a row through the committer
    pub async fn insert_record(&self, side: Side, table: &str, row: &Row) -> Result<()> {
        self.committer.insert_record(side, table, row).await
    }

    /// Update a row through the committer; returns the affected row count
    pub async fn update_record(
        &self,
        side: Side,
        table: &str,
        row: &Row,
        old_key: &RecordKey,
    ) -> Result<u64> {
        self.committer.update_record(side, table, row, old_key).await
    }

    /// Delete a row through the committer; returns the affected row count
    pub async fn delete_record(&self, side: Side, table: &str, key: &RecordKey) -> Result<u64> {
        self.committer.delete_record(side, table, key).await
    }

    /// Whether the next write starts a fresh transaction pair
    pub fn new_transaction(&self) -> bool {
        self.committer.new_transaction()
    }

    /// Commit (success) or roll back (failure) the open transactions
    pub async fn finalize(&self, success: bool) -> Result<()> {
        self.committer.finalize(success).await
    }

    /// Persist the outcome of one replication decision to the event log of
    /// the left database.
    pub async fn log_replication_outcome(
        &self,
        diff: &ReplicationDifference,
        description: &str,
        long_description: &str,
    ) -> Result<()> {
        let left_change = diff.change(Side::Left);
        let right_change = diff.change(Side::Right);

        // The left change always carries table and key once a difference was
        // loaded; fall back to the right side for synthetic differences.
        let change = if left_change.table.is_some() {
            left_change
        } else {
            right_change
        };
        let table = change.table.clone().unwrap_or_default();
        let change_key = change
            .key
            .as_ref()
            .map(|key| key.brief(self.key_sep()))
            .unwrap_or_default();

        let entry = EventLogEntry {
            activity: "replication".to_string(),
            change_table: table,
            diff_type: diff.kind.to_string(),
            change_key,
            left_change_type: left_change.kind.to_string(),
            right_change_type: match right_change.kind {
                crate::change::ChangeType::NoChange => None,
                kind => Some(kind.to_string()),
            },
            description: fit_column(description, DESCRIPTION_SIZE),
            long_description: fit_column(long_description, LONG_DESCRIPTION_SIZE),
            event_time: Utc::now().naive_utc(),
        };

        self.session
            .db(Side::Left)
            .log_event(&self.session.config().logged_events_table(), &entry)
            .await
    }
}

/// Clamp a description to its column size (on a character boundary)
fn fit_column(text: &str, size: usize) -> String {
    text.chars().take(size).collect()
}
