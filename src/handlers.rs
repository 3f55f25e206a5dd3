//! Custom Handlers and Event Filters
//!
//! Tables can route their changes or conflicts to user-supplied handlers and
//! gate replication through an event filter. Handlers are registered by name
//! in a `HandlerRegistry` built at startup and injected into the session;
//! configuration refers to them by that name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::change::RecordKey;
use crate::error::Result;
use crate::replication::{ReplicationDifference, ReplicationHelper};

/// User-supplied handling of a difference, selected per table via the
/// `*_change_handling` / `replication_conflict_handling` options
#[async_trait]
pub trait CustomHandler: Send + Sync {
    async fn handle(
        &self,
        helper: &ReplicationHelper,
        diff: &ReplicationDifference,
    ) -> Result<()>;
}

/// Predicate consulted before each replication. Returning `false` suppresses
/// the replication of that difference; the consumed change log rows stay
/// consumed either way.
#[async_trait]
pub trait EventFilter: Send + Sync {
    async fn before_replicate(
        &self,
        table: &str,
        key: &RecordKey,
        helper: &ReplicationHelper,
        diff: &ReplicationDifference,
    ) -> bool;
}

/// Named registry of custom handlers and event filters
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CustomHandler>>,
    filters: HashMap<String, Arc<dyn EventFilter>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, name: &str, handler: Arc<dyn CustomHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn register_filter(&mut self, name: &str, filter: Arc<dyn EventFilter>) {
        self.filters.insert(name.to_string(), filter);
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn CustomHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn filter(&self, name: &str) -> Option<Arc<dyn EventFilter>> {
        self.filters.get(name).cloned()
    }
}
