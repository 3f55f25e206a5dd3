//! MariaDB Database Side
//!
//! Implements the `Database` trait over a single dedicated sqlx connection.
//! One replication run owns both connections exclusively and controls their
//! transactions with explicit statements, so no pool is involved.
//!
//! Record I/O works on the raw text representation: columns are discovered
//! with DESCRIBE and selected with CAST(... AS CHAR), values are quoted as
//! SQL literals.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::mysql::MySqlConnection;
use sqlx::{Connection, Row as _};
use tokio::sync::Mutex;

use crate::change::RecordKey;
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

use super::{Database, EventLogEntry, PendingChange, RawChangeKind, Row};

/// One side of the replicated pair, backed by MariaDB/MySQL
pub struct MariaDb {
    /// "left" or "right", for error messages and logs
    label: &'static str,
    /// Dedicated connection (None once disconnected)
    conn: Mutex<Option<MySqlConnection>>,
    /// Cached column lists per table
    columns: Mutex<HashMap<String, Vec<String>>>,
}

impl MariaDb {
    /// Connect to the configured database
    pub async fn connect(config: &DatabaseConfig, label: &'static str) -> Result<Self> {
        let url = config.url();
        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let conn = tokio::time::timeout(timeout, MySqlConnection::connect(&url))
            .await
            .map_err(|_| {
                Error::QueryExecution(format!(
                    "Connection to {} database at {}:{} timed out",
                    label, config.host, config.port
                ))
            })??;

        tracing::info!(
            "Connected to {} database at {}:{}/{}",
            label,
            config.host,
            config.port,
            config.database
        );

        Ok(Self {
            label,
            conn: Mutex::new(Some(conn)),
            columns: Mutex::new(HashMap::new()),
        })
    }

    /// Execute a statement and return the number of affected rows
    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected(self.label))?;
        let result = sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                let head: String = sql.chars().take(60).collect();
                Error::QueryExecution(format!("Failed to execute '{}...': {}", head, e))
            })?;
        Ok(result.rows_affected())
    }

    /// Column names of a table, cached after the first DESCRIBE
    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        {
            let cache = self.columns.lock().await;
            if let Some(columns) = cache.get(table) {
                return Ok(columns.clone());
            }
        }

        let sql = format!("DESCRIBE {}", quote_ident(table));
        let rows = {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(Error::NotConnected(self.label))?;
            sqlx::query(&sql).fetch_all(&mut *conn).await?
        };

        let columns: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("Field").ok())
            .collect();
        if columns.is_empty() {
            return Err(Error::QueryExecution(format!(
                "Table '{}' has no columns on the {} database",
                table, self.label
            )));
        }

        let mut cache = self.columns.lock().await;
        cache.insert(table.to_string(), columns.clone());
        Ok(columns)
    }
}

#[async_trait]
impl Database for MariaDb {
    async fn ping(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected(self.label))?;
        conn.ping().await?;
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.execute("START TRANSACTION").await?;
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        self.execute("ROLLBACK").await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close().await?;
            tracing::debug!("Disconnected from {} database", self.label);
        }
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = format!("SHOW TABLES LIKE {}", quote_value(Some(table)));
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected(self.label))?;
        let row = sqlx::query(&sql).fetch_optional(&mut *conn).await?;
        Ok(row.is_some())
    }

    async fn mark_activity(&self, marker_table: &str) -> Result<()> {
        self.execute(&format!("insert into {} values(1)", quote_ident(marker_table)))
            .await?;
        Ok(())
    }

    async fn clear_activity(&self, marker_table: &str) -> Result<()> {
        self.execute(&format!("delete from {}", quote_ident(marker_table)))
            .await?;
        Ok(())
    }

    async fn has_pending_changes(&self, log_table: &str) -> Result<bool> {
        let sql = format!("SELECT id FROM {} LIMIT 1", quote_ident(log_table));
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected(self.label))?;
        let row = sqlx::query(&sql).fetch_optional(&mut *conn).await?;
        Ok(row.is_some())
    }

    async fn max_pending_change_id(&self, log_table: &str) -> Result<Option<i64>> {
        let sql = format!("SELECT MAX(id) FROM {}", quote_ident(log_table));
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected(self.label))?;
        let max: Option<i64> = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
        Ok(max)
    }

    async fn fetch_pending_changes(
        &self,
        log_table: &str,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<PendingChange>> {
        let sql = format!(
            "SELECT id, change_table, change_key, change_new_key, change_type, change_time \
             FROM {} WHERE id > ? ORDER BY id LIMIT ?",
            quote_ident(log_table)
        );
        let rows = {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(Error::NotConnected(self.label))?;
            sqlx::query(&sql)
                .bind(after_id)
                .bind(limit)
                .fetch_all(&mut *conn)
                .await?
        };

        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let kind_code: String = row.try_get("change_type")?;
            changes.push(PendingChange {
                id: row.try_get("id")?,
                table: row.try_get("change_table")?,
                kind: RawChangeKind::from_code(&kind_code)?,
                key: row.try_get("change_key")?,
                new_key: row.try_get("change_new_key")?,
                changed_at: row.try_get::<NaiveDateTime, _>("change_time")?,
            });
        }
        Ok(changes)
    }

    async fn delete_pending_change(&self, log_table: &str, id: i64) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?", quote_ident(log_table));
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected(self.label))?;
        sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
        Ok(())
    }

    async fn log_event(&self, event_table: &str, entry: &EventLogEntry) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (activity, change_table, diff_type, change_key, \
             left_change_type, right_change_type, description, long_description, event_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            quote_ident(event_table)
        );
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected(self.label))?;
        sqlx::query(&sql)
            .bind(&entry.activity)
            .bind(&entry.change_table)
            .bind(&entry.diff_type)
            .bind(&entry.change_key)
            .bind(&entry.left_change_type)
            .bind(&entry.right_change_type)
            .bind(&entry.description)
            .bind(&entry.long_description)
            .bind(entry.event_time)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn load_record(&self, table: &str, key: &RecordKey) -> Result<Option<Row>> {
        let columns = self.table_columns(table).await?;
        let select_list: Vec<String> = columns
            .iter()
            .map(|c| format!("CAST({0} AS CHAR) AS {0}", quote_ident(c)))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            select_list.join(", "),
            quote_ident(table),
            where_clause(key)
        );

        let row = {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(Error::NotConnected(self.label))?;
            sqlx::query(&sql).fetch_optional(&mut *conn).await?
        };

        match row {
            None => Ok(None),
            Some(row) => {
                let mut record = Row::new();
                for column in &columns {
                    let value: Option<String> = row.try_get(column.as_str())?;
                    record.insert(column.clone(), value);
                }
                Ok(Some(record))
            }
        }
    }

    async fn insert_record(&self, table: &str, row: &Row) -> Result<()> {
        let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
        let values: Vec<String> = row.values().map(|v| quote_value(v.as_deref())).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            values.join(", ")
        );
        self.execute(&sql).await?;
        Ok(())
    }

    async fn update_record(&self, table: &str, row: &Row, key: &RecordKey) -> Result<u64> {
        let assignments: Vec<String> = row
            .iter()
            .map(|(c, v)| format!("{} = {}", quote_ident(c), quote_value(v.as_deref())))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table),
            assignments.join(", "),
            where_clause(key)
        );
        self.execute(&sql).await
    }

    async fn delete_record(&self, table: &str, key: &RecordKey) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(table),
            where_clause(key)
        );
        self.execute(&sql).await
    }
}

/// Quote an identifier with backticks
fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a raw text value as a SQL literal
fn quote_value(value: Option<&str>) -> String {
    match value {
        None => "NULL".to_string(),
        Some(v) => format!("'{}'", v.replace('\\', "\\\\").replace('\'', "''")),
    }
}

/// Build a WHERE clause matching the given primary key
fn where_clause(key: &RecordKey) -> String {
    let clauses: Vec<String> = key
        .columns()
        .map(|(c, v)| format!("{} = {}", quote_ident(c), quote_value(Some(v))))
        .collect();
    clauses.join(" AND ")
}
