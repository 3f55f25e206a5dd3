//! Committers
//!
//! The committer is the sole write path of the replication engine. It owns
//! the transaction lifecycle of both databases, buffers row writes, and
//! commits after every `commit_frequency` writes to bound transaction size.
//!
//! While a transaction pair is open, an activity marker row sits in the
//! `{prefix}_running_flags` table of each database so the replication
//! triggers can tell engine writes from application writes. The marker is
//! maintained only when that table exists.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::change::RecordKey;
use crate::db::{Row, Session, Side};
use crate::error::Result;

/// Transaction-buffering write sink for both databases
#[async_trait]
pub trait Committer: Send + Sync {
    /// Insert a row on the given side
    async fn insert_record(&self, side: Side, table: &str, row: &Row) -> Result<()>;

    /// Update the row identified by `old_key`; returns the affected row count
    async fn update_record(
        &self,
        side: Side,
        table: &str,
        row: &Row,
        old_key: &RecordKey,
    ) -> Result<u64>;

    /// Delete the row identified by `key`; returns the affected row count
    async fn delete_record(&self, side: Side, table: &str, key: &RecordKey) -> Result<u64>;

    /// Whether the next write starts a fresh transaction pair
    fn new_transaction(&self) -> bool;

    /// Commit (on success) or roll back (on failure) the open transactions
    async fn finalize(&self, success: bool) -> Result<()>;
}

/// Default committer: commits both transactions every `commit_frequency`
/// row writes
pub struct BufferedCommitter {
    session: Session,
    marker_table: String,
    maintain_activity: bool,
    commit_frequency: u32,
    change_count: AtomicU32,
}

impl BufferedCommitter {
    /// Create the committer and begin the initial transaction pair
    pub async fn new(session: Session) -> Result<Self> {
        let marker_table = session.config().running_flags_table();
        let maintain_activity = session
            .db(Side::Left)
            .table_exists(&marker_table)
            .await?;
        let committer = Self {
            commit_frequency: session.config().replication.commit_frequency,
            session,
            marker_table,
            maintain_activity,
            change_count: AtomicU32::new(0),
        };
        committer.begin_db_transactions().await?;
        Ok(committer)
    }

    /// Begin transactions in both databases and set the activity marker
    async fn begin_db_transactions(&self) -> Result<()> {
        for side in [Side::Left, Side::Right] {
            let db = self.session.db(side);
            db.begin_transaction().await?;
            if self.maintain_activity {
                db.mark_activity(&self.marker_table).await?;
            }
        }
        Ok(())
    }

    /// Clear the activity marker and commit both transactions
    async fn commit_db_transactions(&self) -> Result<()> {
        for side in [Side::Left, Side::Right] {
            let db = self.session.db(side);
            if self.maintain_activity {
                db.clear_activity(&self.marker_table).await?;
            }
            db.commit_transaction().await?;
        }
        Ok(())
    }

    /// Roll back both transactions (the marker rows roll back with them)
    async fn rollback_db_transactions(&self) -> Result<()> {
        for side in [Side::Left, Side::Right] {
            self.session.db(side).rollback_transaction().await?;
        }
        Ok(())
    }

    /// Count one write; commit and reopen the transactions once the
    /// configured frequency is reached
    async fn commit(&self) -> Result<()> {
        let count = self.change_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.commit_frequency {
            self.commit_db_transactions().await?;
            self.begin_db_transactions().await?;
            self.change_count.store(0, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl Committer for BufferedCommitter {
    async fn insert_record(&self, side: Side, table: &str, row: &Row) -> Result<()> {
        self.session.db(side).insert_record(table, row).await?;
        self.commit().await
    }

    async fn update_record(
        &self,
        side: Side,
        table: &str,
        row: &Row,
        old_key: &RecordKey,
    ) -> Result<u64> {
        let affected = self
            .session
            .db(side)
            .update_record(table, row, old_key)
            .await?;
        self.commit().await?;
        Ok(affected)
    }

    async fn delete_record(&self, side: Side, table: &str, key: &RecordKey) -> Result<u64> {
        let affected = self.session.db(side).delete_record(table, key).await?;
        self.commit().await?;
        Ok(affected)
    }

    fn new_transaction(&self) -> bool {
        self.change_count.load(Ordering::SeqCst) == 0
    }

    async fn finalize(&self, success: bool) -> Result<()> {
        if success {
            self.commit_db_transactions().await
        } else {
            self.rollback_db_transactions().await
        }
    }
}
