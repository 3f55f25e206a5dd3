//! In-Memory Database Double
//!
//! A `Database` implementation backed by hash maps, used by the test suite
//! in place of a live MariaDB pair. It reproduces the behaviors the engine
//! depends on (primary key enforcement with MariaDB-style error messages,
//! affected-row counts, change log consumption) and supports injecting
//! one-shot faults to exercise the replication race handling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::change::RecordKey;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::handlers::HandlerRegistry;

use super::{Database, EventLogEntry, PendingChange, RawChangeKind, Row, Session};

/// Operations a fault can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Insert,
    Update,
    Delete,
    LogEvent,
}

struct InjectedFault {
    op: FaultOp,
    table: Option<String>,
    message: String,
}

struct Table {
    pk: Vec<String>,
    rows: BTreeMap<String, Row>,
}

/// In-memory stand-in for one database side
pub struct MemoryDatabase {
    label: &'static str,
    tables: Mutex<HashMap<String, Table>>,
    pending: Mutex<Vec<PendingChange>>,
    next_pending_id: AtomicI64,
    events: Mutex<Vec<EventLogEntry>>,
    faults: Mutex<Vec<InjectedFault>>,
    begin_count: AtomicU32,
    commit_count: AtomicU32,
    rollback_count: AtomicU32,
    activity_marked: AtomicBool,
    disconnected: AtomicBool,
}

impl MemoryDatabase {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            tables: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            next_pending_id: AtomicI64::new(1),
            events: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            begin_count: AtomicU32::new(0),
            commit_count: AtomicU32::new(0),
            rollback_count: AtomicU32::new(0),
            activity_marked: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        })
    }

    /// Create a replicated table with the given primary key columns
    pub fn create_table(&self, name: &str, pk: &[&str]) {
        self.tables.lock().unwrap().insert(
            name.to_string(),
            Table {
                pk: pk.iter().map(|c| c.to_string()).collect(),
                rows: BTreeMap::new(),
            },
        );
    }

    /// Seed a row, bypassing the trigger log
    pub fn seed_row(&self, table: &str, pairs: &[(&str, &str)]) {
        let row: Row = pairs
            .iter()
            .map(|(c, v)| (c.to_string(), Some(v.to_string())))
            .collect();
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(table).expect("table not created");
        let key = encode_pk(&table.pk, &row).expect("seed row misses pk column");
        table.rows.insert(key, row);
    }

    /// All rows of a table, ordered by primary key
    pub fn table_rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Append a change log row as a trigger would
    pub fn push_pending(
        &self,
        table: &str,
        kind: RawChangeKind,
        key: &str,
        new_key: Option<&str>,
        changed_at: NaiveDateTime,
    ) -> i64 {
        let id = self.next_pending_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().unwrap().push(PendingChange {
            id,
            table: table.to_string(),
            kind,
            key: key.to_string(),
            new_key: new_key.map(|k| k.to_string()),
            changed_at,
        });
        id
    }

    /// Remaining (unconsumed) change log rows
    pub fn pending_rows(&self) -> Vec<PendingChange> {
        self.pending.lock().unwrap().clone()
    }

    /// Recorded event log entries
    pub fn events(&self) -> Vec<EventLogEntry> {
        self.events.lock().unwrap().clone()
    }

    /// Inject a one-shot fault for the next matching operation
    pub fn fail_next(&self, op: FaultOp, message: &str) {
        self.faults.lock().unwrap().push(InjectedFault {
            op,
            table: None,
            message: message.to_string(),
        });
    }

    /// Inject a one-shot fault for the next matching operation on a table
    pub fn fail_next_on(&self, op: FaultOp, table: &str, message: &str) {
        self.faults.lock().unwrap().push(InjectedFault {
            op,
            table: Some(table.to_string()),
            message: message.to_string(),
        });
    }

    pub fn begin_count(&self) -> u32 {
        self.begin_count.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> u32 {
        self.commit_count.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u32 {
        self.rollback_count.load(Ordering::SeqCst)
    }

    pub fn activity_marked(&self) -> bool {
        self.activity_marked.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn take_fault(&self, op: FaultOp, table: &str) -> Option<String> {
        let mut faults = self.faults.lock().unwrap();
        let position = faults.iter().position(|f| {
            f.op == op && f.table.as_deref().map(|t| t == table).unwrap_or(true)
        })?;
        Some(faults.remove(position).message)
    }

    fn missing_table(&self, table: &str) -> Error {
        Error::QueryExecution(format!(
            "Table '{}.{}' doesn't exist",
            self.label, table
        ))
    }
}

fn encode_pk(pk: &[String], row: &Row) -> Option<String> {
    let mut tokens = Vec::with_capacity(pk.len() * 2);
    for column in pk {
        let value = row.get(column)?.as_ref()?;
        tokens.push(column.clone());
        tokens.push(value.clone());
    }
    Some(tokens.join("|"))
}

fn encode_key(key: &RecordKey) -> String {
    key.encode("|")
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn ping(&self) -> Result<()> {
        if self.disconnected() {
            return Err(Error::NotConnected(self.label));
        }
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.begin_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.commit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        self.rollback_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.lock().unwrap().contains_key(table))
    }

    async fn mark_activity(&self, marker_table: &str) -> Result<()> {
        if !self.tables.lock().unwrap().contains_key(marker_table) {
            return Err(self.missing_table(marker_table));
        }
        self.activity_marked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_activity(&self, marker_table: &str) -> Result<()> {
        if !self.tables.lock().unwrap().contains_key(marker_table) {
            return Err(self.missing_table(marker_table));
        }
        self.activity_marked.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn has_pending_changes(&self, _log_table: &str) -> Result<bool> {
        Ok(!self.pending.lock().unwrap().is_empty())
    }

    async fn max_pending_change_id(&self, _log_table: &str) -> Result<Option<i64>> {
        Ok(self.pending.lock().unwrap().iter().map(|c| c.id).max())
    }

    async fn fetch_pending_changes(
        &self,
        _log_table: &str,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<PendingChange>> {
        let mut rows: Vec<PendingChange> = self
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.id > after_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.id);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn delete_pending_change(&self, _log_table: &str, id: i64) -> Result<()> {
        self.pending.lock().unwrap().retain(|c| c.id != id);
        Ok(())
    }

    async fn log_event(&self, _event_table: &str, entry: &EventLogEntry) -> Result<()> {
        if let Some(message) = self.take_fault(FaultOp::LogEvent, &entry.change_table) {
            return Err(Error::QueryExecution(message));
        }
        self.events.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn load_record(&self, table: &str, key: &RecordKey) -> Result<Option<Row>> {
        let tables = self.tables.lock().unwrap();
        let table = tables.get(table).ok_or_else(|| self.missing_table(table))?;
        Ok(table.rows.get(&encode_key(key)).cloned())
    }

    async fn insert_record(&self, table: &str, row: &Row) -> Result<()> {
        if let Some(message) = self.take_fault(FaultOp::Insert, table) {
            return Err(Error::QueryExecution(message));
        }
        let mut tables = self.tables.lock().unwrap();
        let name = table;
        let table = tables.get_mut(table).ok_or_else(|| self.missing_table(name))?;
        let key = encode_pk(&table.pk, row).ok_or_else(|| {
            Error::QueryExecution(format!("Field of primary key has no value in '{}'", name))
        })?;
        if table.rows.contains_key(&key) {
            let values: Vec<&str> = table
                .pk
                .iter()
                .filter_map(|c| row.get(c).and_then(|v| v.as_deref()))
                .collect();
            return Err(Error::QueryExecution(format!(
                "Duplicate entry '{}' for key 'PRIMARY'",
                values.join("-")
            )));
        }
        table.rows.insert(key, row.clone());
        Ok(())
    }

    async fn update_record(&self, table: &str, row: &Row, key: &RecordKey) -> Result<u64> {
        if let Some(message) = self.take_fault(FaultOp::Update, table) {
            return Err(Error::QueryExecution(message));
        }
        let mut tables = self.tables.lock().unwrap();
        let name = table;
        let table = tables.get_mut(table).ok_or_else(|| self.missing_table(name))?;
        let old_key = encode_key(key);
        if !table.rows.contains_key(&old_key) {
            return Ok(0);
        }
        let new_key = encode_pk(&table.pk, row).ok_or_else(|| {
            Error::QueryExecution(format!("Field of primary key has no value in '{}'", name))
        })?;
        if new_key != old_key && table.rows.contains_key(&new_key) {
            let values: Vec<&str> = table
                .pk
                .iter()
                .filter_map(|c| row.get(c).and_then(|v| v.as_deref()))
                .collect();
            return Err(Error::QueryExecution(format!(
                "Duplicate entry '{}' for key 'PRIMARY'",
                values.join("-")
            )));
        }
        table.rows.remove(&old_key);
        table.rows.insert(new_key, row.clone());
        Ok(1)
    }

    async fn delete_record(&self, table: &str, key: &RecordKey) -> Result<u64> {
        if let Some(message) = self.take_fault(FaultOp::Delete, table) {
            return Err(Error::QueryExecution(message));
        }
        let mut tables = self.tables.lock().unwrap();
        let name = table;
        let table = tables.get_mut(table).ok_or_else(|| self.missing_table(name))?;
        match table.rows.remove(&encode_key(key)) {
            Some(_) => Ok(1),
            None => Ok(0),
        }
    }
}

/// A minimal valid configuration for tests, with optional extra TOML
pub fn test_config(extra: &str) -> SyncConfig {
    let toml = format!(
        r#"
[left]
host = "localhost"
user = "test"
password = "test"
database = "left_db"

[right]
host = "localhost"
user = "test"
password = "test"
database = "right_db"
{extra}
"#
    );
    SyncConfig::from_str(&toml).expect("test config must parse")
}

/// A session over two fresh in-memory databases with the standard test
/// tables (`left_table`, `right_table`, `scanner_records`, keyed by `id`)
pub fn memory_session() -> (Session, Arc<MemoryDatabase>, Arc<MemoryDatabase>) {
    memory_session_with(test_config(""), HandlerRegistry::new())
}

/// Like `memory_session`, with explicit configuration and handlers
pub fn memory_session_with(
    config: SyncConfig,
    handlers: HandlerRegistry,
) -> (Session, Arc<MemoryDatabase>, Arc<MemoryDatabase>) {
    let left = MemoryDatabase::new("left");
    let right = MemoryDatabase::new("right");
    for db in [&left, &right] {
        db.create_table("left_table", &["id"]);
        db.create_table("right_table", &["id"]);
        db.create_table("scanner_records", &["id"]);
    }
    let session = Session::with_databases(config, left.clone(), right.clone(), handlers);
    (session, left, right)
}

/// Deterministic timestamps for change log rows in tests
pub fn sample_time(offset_secs: i64) -> NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(2024, 6, 1)
        .expect("valid date")
        .and_hms_opt(12, 0, 0)
        .expect("valid time")
        + chrono::Duration::seconds(offset_secs)
}
