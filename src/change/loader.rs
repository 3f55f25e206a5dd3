//! Change Log Cache
//!
//! `LoggedChangeLoader` keeps an in-memory batch of unconsumed change log
//! rows for one database, refreshed in bounded batches ordered by id. Rows
//! stay in the cache (and in the database) until a `LoggedChange` fold
//! consumes them, at which point they are deleted from both.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;

use crate::config::SyncConfig;
use crate::db::{Database, PendingChange, Session, Side};
use crate::error::Result;

/// How long a refreshed cache is trusted before `update` probes the database again
const CACHE_EXPIRE: Duration = Duration::from_secs(1);

/// Per-database cache of pending change log rows
pub struct LoggedChangeLoader {
    db: Arc<dyn Database>,
    side: Side,
    config: Arc<SyncConfig>,
    log_table: String,
    /// Highest change log id fetched so far
    current_id: i64,
    last_updated: Option<Instant>,
    /// Unconsumed rows, ordered by id (trigger fire order)
    entries: BTreeMap<i64, PendingChange>,
}

impl LoggedChangeLoader {
    /// Create a loader and perform the initial fetch
    pub async fn new(session: &Session, side: Side) -> Result<Self> {
        let mut loader = Self {
            db: session.db(side).clone(),
            side,
            config: session.config().clone(),
            log_table: session.config().pending_changes_table(),
            current_id: 0,
            last_updated: None,
            entries: BTreeMap::new(),
        };
        loader.update(true).await?;
        Ok(loader)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// The configured key separator
    pub fn key_sep(&self) -> &str {
        &self.config.replication.key_sep
    }

    /// The session configuration
    pub fn config(&self) -> &Arc<SyncConfig> {
        &self.config
    }

    /// Refresh the cache. Returns whether any new rows were fetched.
    ///
    /// Unforced updates are cheap: within the expiry window nothing happens
    /// at all, and outside it only a MAX(id) probe runs unless the log has
    /// actually grown.
    pub async fn update(&mut self, forced: bool) -> Result<bool> {
        if !forced {
            if let Some(at) = self.last_updated {
                if at.elapsed() < CACHE_EXPIRE {
                    return Ok(false);
                }
            }
        }
        self.last_updated = Some(Instant::now());

        match self.db.max_pending_change_id(&self.log_table).await? {
            Some(latest) if latest > self.current_id => {}
            _ => return Ok(false),
        }

        let rows = self
            .db
            .fetch_pending_changes(
                &self.log_table,
                self.current_id,
                self.config.replication.change_batch_size,
            )
            .await?;
        let fetched = !rows.is_empty();
        for row in rows {
            self.current_id = self.current_id.max(row.id);
            self.entries.insert(row.id, row);
        }
        Ok(fetched)
    }

    /// The oldest unconsumed row, if any
    pub fn oldest(&self) -> Option<&PendingChange> {
        self.entries.values().next()
    }

    /// Timestamp of the oldest unconsumed row
    pub fn oldest_change_time(&self) -> Option<NaiveDateTime> {
        self.oldest().map(|change| change.changed_at)
    }

    /// Remove and return the oldest cached row for the given table and
    /// encoded key, deleting it from the change log table so it can never be
    /// folded twice.
    pub async fn consume_matching(
        &mut self,
        table: &str,
        encoded_key: &str,
    ) -> Result<Option<PendingChange>> {
        let id = self
            .entries
            .values()
            .find(|entry| entry.table == table && entry.key == encoded_key)
            .map(|entry| entry.id);
        let Some(id) = id else {
            return Ok(None);
        };
        self.db.delete_pending_change(&self.log_table, id).await?;
        Ok(self.entries.remove(&id))
    }

    /// Number of unconsumed cached rows
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }
}

/// The left/right pair of change log loaders
pub struct LoggedChangeLoaders {
    pub left: LoggedChangeLoader,
    pub right: LoggedChangeLoader,
}

impl LoggedChangeLoaders {
    /// Create both loaders (each performs its initial fetch)
    pub async fn new(session: &Session) -> Result<Self> {
        let (left, right) = futures::future::try_join(
            LoggedChangeLoader::new(session, Side::Left),
            LoggedChangeLoader::new(session, Side::Right),
        )
        .await?;
        Ok(Self { left, right })
    }

    pub fn get(&self, side: Side) -> &LoggedChangeLoader {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut LoggedChangeLoader {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    /// Force-refresh both loaders. Returns whether either fetched new rows.
    pub async fn update(&mut self) -> Result<bool> {
        let (left, right) =
            futures::future::try_join(self.left.update(true), self.right.update(true)).await?;
        Ok(left || right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{memory_session, sample_time};
    use crate::db::RawChangeKind;

    #[tokio::test]
    async fn test_oldest_change_time_is_none_without_changes() {
        let (session, _left, _right) = memory_session();
        let loader = LoggedChangeLoader::new(&session, Side::Left).await.unwrap();
        assert_eq!(loader.oldest_change_time(), None);
    }

    #[tokio::test]
    async fn test_oldest_change_time_returns_first_change() {
        let (session, left, _right) = memory_session();
        let t1 = sample_time(0);
        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, t1);
        left.push_pending("left_table", RawChangeKind::Insert, "id|2", None, sample_time(100));

        let loader = LoggedChangeLoader::new(&session, Side::Left).await.unwrap();
        assert_eq!(loader.oldest_change_time(), Some(t1));
    }

    #[tokio::test]
    async fn test_update_reports_whether_new_rows_arrived() {
        let (session, left, _right) = memory_session();
        let mut loader = LoggedChangeLoader::new(&session, Side::Left).await.unwrap();

        // Nothing new, forced or not
        assert!(!loader.update(true).await.unwrap());

        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, sample_time(0));
        assert!(loader.update(true).await.unwrap());
        assert_eq!(loader.pending_count(), 1);

        // Already cached, nothing new to fetch
        assert!(!loader.update(true).await.unwrap());
    }

    #[tokio::test]
    async fn test_consume_matching_deletes_from_database() {
        let (session, left, _right) = memory_session();
        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, sample_time(0));

        let mut loader = LoggedChangeLoader::new(&session, Side::Left).await.unwrap();
        let consumed = loader
            .consume_matching("left_table", "id|1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(consumed.key, "id|1");
        assert_eq!(left.pending_rows().len(), 0);

        // A second attempt finds nothing
        assert!(loader
            .consume_matching("left_table", "id|1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_loaders_pair_updates_both_sides() {
        let (session, left, right) = memory_session();
        let mut loaders = LoggedChangeLoaders::new(&session).await.unwrap();
        assert!(!loaders.update().await.unwrap());

        right.push_pending("t", RawChangeKind::Delete, "id|9", None, sample_time(0));
        assert!(loaders.update().await.unwrap());
        assert_eq!(loaders.get(Side::Right).pending_count(), 1);
        assert_eq!(loaders.get(Side::Left).pending_count(), 0);
        let _ = left;
    }
}
