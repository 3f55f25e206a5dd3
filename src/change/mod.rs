//! Change Capture
//!
//! Reads the trigger-populated change log tables and aggregates their raw
//! rows into net logical changes per record.

mod key;
mod loader;
mod logged;

pub use key::RecordKey;
pub use loader::{LoggedChangeLoader, LoggedChangeLoaders};
pub use logged::{ChangeType, LoggedChange};
