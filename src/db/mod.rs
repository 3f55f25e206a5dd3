//! Database Access Layer
//!
//! The `Database` trait is the seam between the replication engine and the
//! actual SQL server: change-log reads, record I/O on the replicated tables,
//! event logging, and transaction control for one side. `Session` bundles
//! the two sides together with the configuration and handler registry.

mod mariadb;
#[cfg(test)]
pub mod memory;

pub use mariadb::MariaDb;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::change::RecordKey;
use crate::config::SyncConfig;
use crate::handlers::HandlerRegistry;
use crate::error::{Error, Result};

/// Identifies one of the two replicated databases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// The opposite side
    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A table row in its raw text representation: column name to value, with
/// `None` for SQL NULL. Values are not cast to native types.
pub type Row = BTreeMap<String, Option<String>>;

/// Raw change type recorded by the database triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawChangeKind {
    Insert,
    Update,
    Delete,
}

impl RawChangeKind {
    /// Parse the single-character code stored in the change log
    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "I" => Ok(RawChangeKind::Insert),
            "U" => Ok(RawChangeKind::Update),
            "D" => Ok(RawChangeKind::Delete),
            other => Err(Error::UnknownChangeType(other.to_string())),
        }
    }

    pub fn code(self) -> char {
        match self {
            RawChangeKind::Insert => 'I',
            RawChangeKind::Update => 'U',
            RawChangeKind::Delete => 'D',
        }
    }
}

/// One row of the trigger-populated pending changes table
#[derive(Debug, Clone)]
pub struct PendingChange {
    /// Monotonic id, corresponds to trigger fire order
    pub id: i64,
    /// Name of the changed table
    pub table: String,
    /// Change type
    pub kind: RawChangeKind,
    /// Encoded primary key of the changed row
    pub key: String,
    /// Encoded new primary key (only for updates that change the key)
    pub new_key: Option<String>,
    /// When the trigger fired
    pub changed_at: NaiveDateTime,
}

/// One row of the replication event log
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub activity: String,
    pub change_table: String,
    pub diff_type: String,
    pub change_key: String,
    pub left_change_type: String,
    pub right_change_type: Option<String>,
    pub description: String,
    pub long_description: String,
    pub event_time: NaiveDateTime,
}

/// Operations the replication engine needs from one database side
#[async_trait]
pub trait Database: Send + Sync {
    /// Check that the connection is alive
    async fn ping(&self) -> Result<()>;

    /// Begin a transaction on the dedicated connection
    async fn begin_transaction(&self) -> Result<()>;

    /// Commit the open transaction
    async fn commit_transaction(&self) -> Result<()>;

    /// Roll back the open transaction
    async fn rollback_transaction(&self) -> Result<()>;

    /// Close the connection entirely
    async fn disconnect(&self) -> Result<()>;

    /// Check whether a table exists
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Insert the running-flag row into the activity marker table
    async fn mark_activity(&self, marker_table: &str) -> Result<()>;

    /// Clear the activity marker table
    async fn clear_activity(&self, marker_table: &str) -> Result<()>;

    /// Cheap existence probe for pending change log rows
    async fn has_pending_changes(&self, log_table: &str) -> Result<bool>;

    /// Highest id currently present in the change log (staleness probe)
    async fn max_pending_change_id(&self, log_table: &str) -> Result<Option<i64>>;

    /// Fetch up to `limit` change log rows with id greater than `after_id`,
    /// ordered by id
    async fn fetch_pending_changes(
        &self,
        log_table: &str,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<PendingChange>>;

    /// Delete one consumed change log row
    async fn delete_pending_change(&self, log_table: &str, id: i64) -> Result<()>;

    /// Append an entry to the replication event log
    async fn log_event(&self, event_table: &str, entry: &EventLogEntry) -> Result<()>;

    /// Load the current row for the given key, if present
    async fn load_record(&self, table: &str, key: &RecordKey) -> Result<Option<Row>>;

    /// Insert a row
    async fn insert_record(&self, table: &str, row: &Row) -> Result<()>;

    /// Update the row identified by `key` to the given values; returns the
    /// number of affected rows
    async fn update_record(&self, table: &str, row: &Row, key: &RecordKey) -> Result<u64>;

    /// Delete the row identified by `key`; returns the number of affected rows
    async fn delete_record(&self, table: &str, key: &RecordKey) -> Result<u64>;
}

/// An open replication session: configuration plus the two database sides.
///
/// The databases are owned exclusively by one replication run at a time
/// (the engine never shares them across concurrent runs).
#[derive(Clone)]
pub struct Session {
    config: Arc<SyncConfig>,
    left: Arc<dyn Database>,
    right: Arc<dyn Database>,
    handlers: Arc<HandlerRegistry>,
}

impl Session {
    /// Connect to both configured databases
    pub async fn connect(config: SyncConfig, handlers: HandlerRegistry) -> Result<Self> {
        let (left, right) = futures::future::try_join(
            MariaDb::connect(&config.left, "left"),
            MariaDb::connect(&config.right, "right"),
        )
        .await?;
        Ok(Self {
            config: Arc::new(config),
            left: Arc::new(left),
            right: Arc::new(right),
            handlers: Arc::new(handlers),
        })
    }

    /// Build a session over externally constructed databases (dependency
    /// injection seam, also used by the test suite)
    pub fn with_databases(
        config: SyncConfig,
        left: Arc<dyn Database>,
        right: Arc<dyn Database>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            left,
            right,
            handlers: Arc::new(handlers),
        }
    }

    pub fn config(&self) -> &Arc<SyncConfig> {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The database for the given side
    pub fn db(&self, side: Side) -> &Arc<dyn Database> {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Check whether either side has pending change log rows
    pub async fn has_pending_changes(&self) -> Result<bool> {
        let table = self.config.pending_changes_table();
        let (left, right) = futures::future::try_join(
            self.left.has_pending_changes(&table),
            self.right.has_pending_changes(&table),
        )
        .await?;
        Ok(left || right)
    }

    /// Close both database connections
    pub async fn disconnect_databases(&self) -> Result<()> {
        self.left.disconnect().await?;
        self.right.disconnect().await?;
        Ok(())
    }
}
