//! Logged Changes
//!
//! A `LoggedChange` is the net logical change for one record, folded from
//! the ordered raw change log rows the triggers wrote for it. Folding is
//! destructive: every raw row it absorbs is deleted from the change log.

use chrono::NaiveDateTime;

use crate::db::{PendingChange, RawChangeKind, Side};
use crate::error::Result;

use super::key::RecordKey;
use super::loader::LoggedChangeLoader;

/// Net type of a logged change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// No raw rows matched; the record is unchanged since the last sync
    NoChange,
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::NoChange => "no_change",
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated pending change for one record in one database
#[derive(Debug, Clone)]
pub struct LoggedChange {
    side: Side,
    /// Name of the changed table (set once loaded)
    pub table: Option<String>,
    /// Net change type
    pub kind: ChangeType,
    /// First-seen key of the logical change
    pub key: Option<RecordKey>,
    /// Latest new key; only populated while the net type is `update`
    pub new_key: Option<RecordKey>,
    /// Timestamp of the last raw row folded in
    pub last_changed_at: Option<NaiveDateTime>,
}

impl LoggedChange {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            table: None,
            kind: ChangeType::NoChange,
            key: None,
            new_key: None,
            last_changed_at: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// The key the record currently lives under (`new_key` for renames)
    pub fn current_key(&self) -> Option<&RecordKey> {
        self.new_key.as_ref().or(self.key.as_ref())
    }

    /// Fold all pending raw rows for the given table and key into this
    /// change, consuming (and deleting) them from the change log.
    ///
    /// May be called again after more rows arrived; the fold then continues
    /// from the current state.
    pub async fn load_specified(
        &mut self,
        loader: &mut LoggedChangeLoader,
        table: &str,
        key: RecordKey,
    ) -> Result<()> {
        let sep = loader.key_sep().to_string();
        self.table = Some(table.to_string());
        if self.key.is_none() {
            self.key = Some(key.clone());
        }
        let mut current_key = key;

        while let Some(raw) = loader
            .consume_matching(table, &current_key.encode(&sep))
            .await?
        {
            self.fold(raw, &mut current_key, &sep)?;
        }
        Ok(())
    }

    /// Amend this change with raw rows that arrived after it was loaded
    pub async fn load(&mut self, loader: &mut LoggedChangeLoader) -> Result<()> {
        let Some(table) = self.table.clone() else {
            return Ok(());
        };
        let Some(key) = self.current_key().cloned() else {
            return Ok(());
        };
        self.load_specified(loader, &table, key).await
    }

    /// Claim the chronologically oldest pending change. Keys whose rows fold
    /// to `no_change` are consumed and skipped until a non-trivial change or
    /// exhaustion.
    pub async fn load_oldest(&mut self, loader: &mut LoggedChangeLoader) -> Result<()> {
        loop {
            let Some(oldest) = loader.oldest() else {
                return Ok(());
            };
            let table = oldest.table.clone();
            let key = RecordKey::decode(&oldest.key, loader.key_sep())?;

            self.reset();
            self.load_specified(loader, &table, key).await?;
            if self.kind != ChangeType::NoChange {
                return Ok(());
            }
        }
    }

    fn reset(&mut self) {
        self.table = None;
        self.kind = ChangeType::NoChange;
        self.key = None;
        self.new_key = None;
        self.last_changed_at = None;
    }

    /// Apply one raw row to the fold state.
    ///
    /// `current_key` is the key used to match further raw rows; it follows
    /// `new_key` while the net type is `update` and stays put otherwise.
    fn fold(
        &mut self,
        raw: PendingChange,
        current_key: &mut RecordKey,
        sep: &str,
    ) -> Result<()> {
        use ChangeType::*;

        self.last_changed_at = Some(raw.changed_at);
        let raw_new_key = match raw.new_key.as_deref() {
            Some(encoded) => Some(RecordKey::decode(encoded, sep)?),
            None => None,
        };

        match (self.kind, raw.kind) {
            (NoChange, RawChangeKind::Insert) => {
                self.kind = Insert;
                self.new_key = None;
            }
            (NoChange, RawChangeKind::Update) => {
                self.kind = Update;
                self.new_key = Some(raw_new_key.unwrap_or_else(|| current_key.clone()));
            }
            (NoChange, RawChangeKind::Delete) => {
                self.kind = Delete;
                self.new_key = None;
            }
            // Duplicate insert, idempotent
            (Insert, RawChangeKind::Insert) => {}
            // The pending insert now covers the renamed row; it stays an
            // insert under the original key
            (Insert, RawChangeKind::Update) => {}
            // Insert followed by delete cancels out entirely
            (Insert, RawChangeKind::Delete) => {
                self.kind = NoChange;
                self.new_key = None;
            }
            // Insert for a key already marked updated: continued update
            (Update, RawChangeKind::Insert) => {}
            (Update, RawChangeKind::Update) => {
                self.new_key = Some(raw_new_key.unwrap_or_else(|| current_key.clone()));
            }
            (Update, RawChangeKind::Delete) => {
                // The row was deleted under its latest key; that key is the
                // one the delete must target
                self.kind = Delete;
                if let Some(new_key) = self.new_key.take() {
                    self.key = Some(new_key);
                }
            }
            // The record was deleted and reinserted: net effect is an update
            (Delete, RawChangeKind::Insert) => {
                self.kind = Update;
                self.new_key = Some(RecordKey::decode(&raw.key, sep)?);
            }
            // Update for a key already marked deleted: the triggers should
            // never produce this ordering
            (Delete, RawChangeKind::Update) => {
                tracing::warn!(
                    table = %raw.table,
                    key = %raw.key,
                    "update logged for a deleted record, treating as update"
                );
                self.kind = Update;
                self.new_key = Some(raw_new_key.unwrap_or_else(|| current_key.clone()));
            }
            // Duplicate delete, idempotent
            (Delete, RawChangeKind::Delete) => {}
        }

        if let Some(new_key) = &self.new_key {
            *current_key = new_key.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::loader::LoggedChangeLoaders;
    use crate::db::memory::{memory_session, sample_time};
    use crate::db::Side;

    async fn left_loader(session: &crate::db::Session) -> LoggedChangeLoader {
        LoggedChangeLoader::new(session, Side::Left).await.unwrap()
    }

    #[tokio::test]
    async fn test_load_specified_loads_the_requested_change() {
        let (session, left, _right) = memory_session();
        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, sample_time(0));
        left.push_pending("right_table", RawChangeKind::Update, "id|2", Some("id|2"), sample_time(1));
        left.push_pending("left_table", RawChangeKind::Insert, "id|2", None, sample_time(2));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change
            .load_specified(&mut loader, "left_table", RecordKey::single("id", "2"))
            .await
            .unwrap();

        assert_eq!(change.table.as_deref(), Some("left_table"));
        assert_eq!(change.kind, ChangeType::Insert);
        assert_eq!(change.key, Some(RecordKey::single("id", "2")));
        // The other two rows are untouched
        assert_eq!(left.pending_rows().len(), 2);
    }

    #[tokio::test]
    async fn test_load_specified_accepts_composite_keys() {
        let (session, left, _right) = memory_session();
        left.push_pending("scanner_records", RawChangeKind::Insert, "id1|1|id2|2", None, sample_time(0));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change
            .load_specified(
                &mut loader,
                "scanner_records",
                RecordKey::decode("id1|1|id2|2", "|").unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(change.kind, ChangeType::Insert);
        assert_eq!(
            change.key,
            Some(RecordKey::new(vec![
                ("id1".to_string(), "1".to_string()),
                ("id2".to_string(), "2".to_string()),
            ]))
        );
    }

    #[tokio::test]
    async fn test_load_specified_deletes_consumed_rows() {
        let (session, left, _right) = memory_session();
        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, sample_time(0));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change
            .load_specified(&mut loader, "left_table", RecordKey::single("id", "1"))
            .await
            .unwrap();

        assert_eq!(left.pending_rows().len(), 0);
    }

    #[tokio::test]
    async fn test_insert_update_delete_chain_keeps_the_insert() {
        let (session, left, _right) = memory_session();
        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, sample_time(0));
        left.push_pending("left_table", RawChangeKind::Update, "id|1", Some("id|2"), sample_time(1));
        left.push_pending("left_table", RawChangeKind::Delete, "id|2", None, sample_time(2));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change
            .load_specified(&mut loader, "left_table", RecordKey::single("id", "1"))
            .await
            .unwrap();

        // The insert absorbs the rename but keeps its original key; the
        // delete belongs to the renamed key and stays pending
        assert_eq!(change.kind, ChangeType::Insert);
        assert_eq!(change.key, Some(RecordKey::single("id", "1")));
        assert_eq!(left.pending_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_then_delete_cancels_out() {
        let (session, left, _right) = memory_session();
        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, sample_time(0));
        left.push_pending("left_table", RawChangeKind::Delete, "id|1", None, sample_time(1));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change
            .load_specified(&mut loader, "left_table", RecordKey::single("id", "1"))
            .await
            .unwrap();

        assert_eq!(change.kind, ChangeType::NoChange);
        assert_eq!(left.pending_rows().len(), 0);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (session, left, _right) = memory_session();

        // First case: insert, delete, insert, update
        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, sample_time(0));
        left.push_pending("left_table", RawChangeKind::Delete, "id|1", None, sample_time(1));
        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, sample_time(2));
        left.push_pending("left_table", RawChangeKind::Update, "id|1", Some("id|2"), sample_time(3));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change
            .load_specified(&mut loader, "left_table", RecordKey::single("id", "1"))
            .await
            .unwrap();
        assert_eq!(change.kind, ChangeType::Insert);
        assert_eq!(change.key, Some(RecordKey::single("id", "1")));

        // Second case: delete followed by reinsert nets to an update
        left.push_pending("left_table", RawChangeKind::Delete, "id|5", None, sample_time(4));
        left.push_pending("left_table", RawChangeKind::Insert, "id|5", None, sample_time(5));
        loader.update(true).await.unwrap();

        let mut change = LoggedChange::new(Side::Left);
        change
            .load_specified(&mut loader, "left_table", RecordKey::single("id", "5"))
            .await
            .unwrap();
        assert_eq!(change.kind, ChangeType::Update);
        assert_eq!(change.key, Some(RecordKey::single("id", "5")));
        assert_eq!(change.new_key, Some(RecordKey::single("id", "5")));
    }

    #[tokio::test]
    async fn test_update_then_delete_folds_to_delete_under_latest_key() {
        let (session, left, _right) = memory_session();
        left.push_pending("left_table", RawChangeKind::Update, "id|1", Some("id|1"), sample_time(0));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change
            .load_specified(&mut loader, "left_table", RecordKey::single("id", "1"))
            .await
            .unwrap();
        assert_eq!(change.kind, ChangeType::Update);

        // A delete arrives later; amending folds it in
        left.push_pending("left_table", RawChangeKind::Delete, "id|1", None, sample_time(1));
        loader.update(true).await.unwrap();
        change.load(&mut loader).await.unwrap();

        assert_eq!(change.kind, ChangeType::Delete);
        assert_eq!(change.key, Some(RecordKey::single("id", "1")));
    }

    #[tokio::test]
    async fn test_amend_without_new_rows_is_a_no_op() {
        let (session, left, _right) = memory_session();
        left.push_pending("scanner_records", RawChangeKind::Insert, "id|1", None, sample_time(0));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change
            .load_specified(&mut loader, "scanner_records", RecordKey::single("id", "1"))
            .await
            .unwrap();
        assert_eq!(change.kind, ChangeType::Insert);

        change.load(&mut loader).await.unwrap();
        assert_eq!(change.kind, ChangeType::Insert);
        assert_eq!(change.key, Some(RecordKey::single("id", "1")));

        // Amending an untouched record is also fine
        let mut untouched = LoggedChange::new(Side::Left);
        untouched
            .load_specified(&mut loader, "scanner_records", RecordKey::single("id", "9"))
            .await
            .unwrap();
        assert_eq!(untouched.kind, ChangeType::NoChange);
        untouched.load(&mut loader).await.unwrap();
        assert_eq!(untouched.kind, ChangeType::NoChange);
        assert_eq!(untouched.key, Some(RecordKey::single("id", "9")));
    }

    #[tokio::test]
    async fn test_load_oldest_picks_the_oldest_change() {
        let (session, left, _right) = memory_session();
        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, sample_time(0));
        left.push_pending("left_table", RawChangeKind::Insert, "id|2", None, sample_time(1));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change.load_oldest(&mut loader).await.unwrap();

        assert_eq!(change.key, Some(RecordKey::single("id", "1")));
    }

    #[tokio::test]
    async fn test_load_oldest_skips_changes_that_cancel_out() {
        let (session, left, _right) = memory_session();
        left.push_pending("left_table", RawChangeKind::Insert, "id|1", None, sample_time(0));
        left.push_pending("left_table", RawChangeKind::Delete, "id|1", None, sample_time(1));
        left.push_pending("left_table", RawChangeKind::Insert, "id|2", None, sample_time(2));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change.load_oldest(&mut loader).await.unwrap();

        assert_eq!(change.kind, ChangeType::Insert);
        assert_eq!(change.key, Some(RecordKey::single("id", "2")));
        // The cancelled pair was consumed as well
        assert_eq!(left.pending_rows().len(), 0);
    }

    #[tokio::test]
    async fn test_load_oldest_without_changes_stays_unloaded() {
        let (session, _left, _right) = memory_session();
        let mut loaders = LoggedChangeLoaders::new(&session).await.unwrap();
        let mut change = LoggedChange::new(Side::Left);
        change
            .load_oldest(loaders.get_mut(Side::Left))
            .await
            .unwrap();
        assert_eq!(change.kind, ChangeType::NoChange);
        assert_eq!(change.key, None);
    }

    #[tokio::test]
    async fn test_delete_then_update_is_handled_defensively() {
        let (session, left, _right) = memory_session();
        left.push_pending("left_table", RawChangeKind::Delete, "id|1", None, sample_time(0));
        left.push_pending("left_table", RawChangeKind::Update, "id|1", Some("id|3"), sample_time(1));

        let mut loader = left_loader(&session).await;
        let mut change = LoggedChange::new(Side::Left);
        change
            .load_specified(&mut loader, "left_table", RecordKey::single("id", "1"))
            .await
            .unwrap();

        assert_eq!(change.kind, ChangeType::Update);
        assert_eq!(change.key, Some(RecordKey::single("id", "1")));
        assert_eq!(change.new_key, Some(RecordKey::single("id", "3")));
    }
}
