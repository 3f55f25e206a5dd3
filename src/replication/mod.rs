//! Replication Engine
//!
//! Pairs the pending changes of both databases into classified differences
//! and applies the configured handling for each: the decision engine
//! (`TwoWayReplicator`), its record I/O mediator (`ReplicationHelper`), and
//! the driving loop (`ReplicationRun`).

mod difference;
mod helper;
mod run;
mod two_way;

pub use difference::{DiffType, ReplicationDifference};
pub use helper::ReplicationHelper;
pub use run::ReplicationRun;
pub use two_way::TwoWayReplicator;
