//! Twinsync - Trigger-Based Bidirectional Database Synchronization
//!
//! Twinsync keeps two live MariaDB/MySQL databases continuously
//! synchronized without a shared transaction. Database triggers record
//! every row-level change into a per-database pending changes table;
//! twinsync folds those raw entries into net logical changes, pairs them
//! across the two databases, and propagates each difference, resolving
//! conflicts by a configurable per-table policy.
//!
//! # Architecture
//!
//! - Change capture: `LoggedChangeLoader` caches unconsumed change log rows
//!   per database; `LoggedChange` folds them into one net change per record.
//! - Pairing: `ReplicationDifference` loads the oldest pending change plus
//!   its counterpart from the other database and classifies the pair as a
//!   one-sided change or a conflict.
//! - Decision: `TwoWayReplicator` applies the configured handling per table
//!   and retries when a write races with concurrent application traffic.
//! - Driving loop: `ReplicationRun` drains all current differences inside
//!   one transaction pair per database, supervised by a cooperative
//!   watchdog and heartbeat.
//!
//! Changes are applied eventually and row by row; there is no cross-database
//! transaction. The event log and the second-chance retry queue are the
//! compensating controls for the races this model permits.

pub mod change;
pub mod committer;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod heartbeat;
pub mod replication;
pub mod runner;
pub mod sweeper;

pub use config::SyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::change::{ChangeType, LoggedChange, LoggedChangeLoaders, RecordKey};
    pub use crate::config::SyncConfig;
    pub use crate::db::{Session, Side};
    pub use crate::error::{Error, Result};
    pub use crate::handlers::HandlerRegistry;
    pub use crate::replication::{DiffType, ReplicationDifference, ReplicationRun, TwoWayReplicator};
    pub use crate::runner::ReplicationRunner;
}
