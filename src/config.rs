//! Twinsync Configuration
//!
//! Configuration structures for the twinsync replication engine: the two
//! database endpoints, global replication settings, and per-table overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::db::Side;

/// Main twinsync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Left database connection configuration
    pub left: DatabaseConfig,

    /// Right database connection configuration
    pub right: DatabaseConfig,

    /// Replication settings
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Per-table replication overrides
    #[serde(default, rename = "table")]
    pub tables: Vec<TableSpec>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// MariaDB host
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    pub user: String,

    /// Database password
    pub password: String,

    /// Database name
    pub database: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Get the database connection URL
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Global replication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Prefix for the replication infrastructure tables
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Separator used in encoded change keys
    #[serde(default = "default_key_sep")]
    pub key_sep: String,

    /// Number of row writes between transaction commits
    #[serde(default = "default_commit_frequency")]
    pub commit_frequency: u32,

    /// Maximum attempts to replicate a single difference
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Maximum change log rows fetched per cache refresh
    #[serde(default = "default_change_batch_size")]
    pub change_batch_size: u32,

    /// Seconds between replication runs
    #[serde(default = "default_run_interval_secs")]
    pub run_interval_secs: u64,

    /// Seconds a run may stall (no progress) before the watchdog gives up on it
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Liveness file updated on every heartbeat (optional)
    #[serde(default)]
    pub heartbeat_file: Option<PathBuf>,

    /// Default handling of changes originating in the left database
    #[serde(default = "default_change_handling")]
    pub left_change_handling: ChangeHandling,

    /// Default handling of changes originating in the right database
    #[serde(default = "default_change_handling")]
    pub right_change_handling: ChangeHandling,

    /// Default handling of conflicting changes
    #[serde(default = "default_conflict_handling")]
    pub replication_conflict_handling: ConflictHandling,

    /// Which replication outcomes are written to the event log
    #[serde(default = "default_logged_events")]
    pub logged_replication_events: Vec<LoggedEvent>,

    /// Name of a registered event filter consulted before each replication
    #[serde(default)]
    pub event_filter: Option<String>,
}

/// Per-table replication overrides.
///
/// `left` is the table name in the left database; `right` defaults to the
/// same name. Unset options fall back to the global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name in the left database
    pub left: String,

    /// Table name in the right database (defaults to `left`)
    #[serde(default)]
    pub right: Option<String>,

    #[serde(default)]
    pub left_change_handling: Option<ChangeHandling>,

    #[serde(default)]
    pub right_change_handling: Option<ChangeHandling>,

    #[serde(default)]
    pub replication_conflict_handling: Option<ConflictHandling>,

    #[serde(default)]
    pub logged_replication_events: Option<Vec<LoggedEvent>>,

    #[serde(default)]
    pub event_filter: Option<String>,
}

/// Handling policy for one-sided changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeHandling {
    /// Consume the change without propagating it
    Ignore,
    /// Copy the change to the other database
    Replicate,
    /// Delegate to a named handler from the handler registry
    Custom(String),
}

impl From<String> for ChangeHandling {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ignore" => ChangeHandling::Ignore,
            "replicate" => ChangeHandling::Replicate,
            _ => ChangeHandling::Custom(value),
        }
    }
}

impl From<ChangeHandling> for String {
    fn from(value: ChangeHandling) -> Self {
        match value {
            ChangeHandling::Ignore => "ignore".to_string(),
            ChangeHandling::Replicate => "replicate".to_string(),
            ChangeHandling::Custom(name) => name,
        }
    }
}

/// Handling policy for conflicting changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConflictHandling {
    /// Consume both changes without touching either database
    Ignore,
    /// The left change always wins
    LeftWins,
    /// The right change always wins
    RightWins,
    /// The more recently changed side wins (ties go to left)
    LaterWins,
    /// The earlier changed side wins (ties go to left)
    EarlierWins,
    /// Delegate to a named handler from the handler registry
    Custom(String),
}

impl From<String> for ConflictHandling {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ignore" => ConflictHandling::Ignore,
            "left_wins" => ConflictHandling::LeftWins,
            "right_wins" => ConflictHandling::RightWins,
            "later_wins" => ConflictHandling::LaterWins,
            "earlier_wins" => ConflictHandling::EarlierWins,
            _ => ConflictHandling::Custom(value),
        }
    }
}

impl From<ConflictHandling> for String {
    fn from(value: ConflictHandling) -> Self {
        match value {
            ConflictHandling::Ignore => "ignore".to_string(),
            ConflictHandling::LeftWins => "left_wins".to_string(),
            ConflictHandling::RightWins => "right_wins".to_string(),
            ConflictHandling::LaterWins => "later_wins".to_string(),
            ConflictHandling::EarlierWins => "earlier_wins".to_string(),
            ConflictHandling::Custom(name) => name,
        }
    }
}

/// Replication outcomes that can be recorded in the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggedEvent {
    IgnoredChanges,
    AllChanges,
    IgnoredConflicts,
    AllConflicts,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Fully resolved options for one table (global settings merged with the
/// table's overrides)
#[derive(Debug, Clone)]
pub struct TableOptions {
    pub left_change_handling: ChangeHandling,
    pub right_change_handling: ChangeHandling,
    pub replication_conflict_handling: ConflictHandling,
    pub logged_replication_events: Vec<LoggedEvent>,
    pub event_filter: Option<String>,
}

// Default value functions
fn default_db_port() -> u16 {
    3306
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_prefix() -> String {
    "rr".to_string()
}

fn default_key_sep() -> String {
    "|".to_string()
}

fn default_commit_frequency() -> u32 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_change_batch_size() -> u32 {
    1000
}

fn default_run_interval_secs() -> u64 {
    2
}

fn default_run_timeout_secs() -> u64 {
    60
}

fn default_change_handling() -> ChangeHandling {
    ChangeHandling::Replicate
}

fn default_conflict_handling() -> ConflictHandling {
    ConflictHandling::Ignore
}

fn default_logged_events() -> Vec<LoggedEvent> {
    vec![LoggedEvent::IgnoredConflicts]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            key_sep: default_key_sep(),
            commit_frequency: default_commit_frequency(),
            max_attempts: default_max_attempts(),
            change_batch_size: default_change_batch_size(),
            run_interval_secs: default_run_interval_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            heartbeat_file: None,
            left_change_handling: default_change_handling(),
            right_change_handling: default_change_handling(),
            replication_conflict_handling: default_conflict_handling(),
            logged_replication_events: default_logged_events(),
            event_filter: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        for (name, db) in [("left", &self.left), ("right", &self.right)] {
            if db.host.is_empty() {
                return Err(crate::Error::Config(format!("{name}.host cannot be empty")));
            }
            if db.database.is_empty() {
                return Err(crate::Error::Config(format!(
                    "{name}.database cannot be empty"
                )));
            }
        }

        if self.replication.prefix.is_empty() {
            return Err(crate::Error::Config(
                "replication.prefix cannot be empty".into(),
            ));
        }
        if self.replication.key_sep.is_empty() {
            return Err(crate::Error::Config(
                "replication.key_sep cannot be empty".into(),
            ));
        }
        if self.replication.commit_frequency == 0 {
            return Err(crate::Error::Config(
                "replication.commit_frequency must be at least 1".into(),
            ));
        }
        if self.replication.max_attempts == 0 {
            return Err(crate::Error::Config(
                "replication.max_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Name of the trigger-populated pending changes table
    pub fn pending_changes_table(&self) -> String {
        format!("{}_pending_changes", self.replication.prefix)
    }

    /// Name of the replication event log table
    pub fn logged_events_table(&self) -> String {
        format!("{}_logged_events", self.replication.prefix)
    }

    /// Name of the activity marker table
    pub fn running_flags_table(&self) -> String {
        format!("{}_running_flags", self.replication.prefix)
    }

    /// Seconds between replication runs, as a Duration
    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.replication.run_interval_secs)
    }

    /// Watchdog stall timeout for a single run, as a Duration
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.run_timeout_secs)
    }

    /// Find the table spec covering the given table name on either side
    fn table_spec(&self, table: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|spec| {
            spec.left == table || spec.right.as_deref() == Some(table)
        })
    }

    /// Resolve the effective options for a table by merging its spec (if any)
    /// into the global replication settings
    pub fn options_for_table(&self, table: &str) -> TableOptions {
        let global = &self.replication;
        let spec = self.table_spec(table);
        TableOptions {
            left_change_handling: spec
                .and_then(|s| s.left_change_handling.clone())
                .unwrap_or_else(|| global.left_change_handling.clone()),
            right_change_handling: spec
                .and_then(|s| s.right_change_handling.clone())
                .unwrap_or_else(|| global.right_change_handling.clone()),
            replication_conflict_handling: spec
                .and_then(|s| s.replication_conflict_handling.clone())
                .unwrap_or_else(|| global.replication_conflict_handling.clone()),
            logged_replication_events: spec
                .and_then(|s| s.logged_replication_events.clone())
                .unwrap_or_else(|| global.logged_replication_events.clone()),
            event_filter: spec
                .and_then(|s| s.event_filter.clone())
                .or_else(|| global.event_filter.clone()),
        }
    }

    /// Map a table name from the given source side to its counterpart on the
    /// other side. Tables without a spec keep the same name on both sides.
    pub fn corresponding_table(&self, source: Side, table: &str) -> String {
        match self.table_spec(table) {
            Some(spec) => match source {
                Side::Left => spec.right.clone().unwrap_or_else(|| spec.left.clone()),
                Side::Right => spec.left.clone(),
            },
            None => table.to_string(),
        }
    }

    /// Produce a commented sample configuration
    pub fn sample() -> &'static str {
        r#"# twinsync configuration

[left]
host = "localhost"
port = 3306
user = "twinsync"
password = "secret"
database = "app_primary"

[right]
host = "replica.example.com"
port = 3306
user = "twinsync"
password = "secret"
database = "app_secondary"

[replication]
# prefix = "rr"
# key_sep = "|"
# commit_frequency = 1000
# max_attempts = 3
# run_interval_secs = 2
# run_timeout_secs = 60
# heartbeat_file = "/var/run/twinsync.heartbeat"
# left_change_handling = "replicate"
# right_change_handling = "replicate"
# replication_conflict_handling = "ignore"
# logged_replication_events = ["ignored_conflicts"]

# Per-table overrides:
# [[table]]
# left = "users"
# right = "users_mirror"
# replication_conflict_handling = "later_wins"
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(extra: &str) -> String {
        format!(
            r#"
[left]
host = "localhost"
user = "a"
password = "b"
database = "appdb"

[right]
host = "localhost"
user = "a"
password = "b"
database = "appdb_mirror"
{extra}
"#
        )
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = SyncConfig::from_str(&minimal_config("")).unwrap();
        assert_eq!(config.left.port, 3306);
        assert_eq!(config.replication.prefix, "rr");
        assert_eq!(config.replication.key_sep, "|");
        assert_eq!(config.replication.commit_frequency, 1000);
        assert_eq!(
            config.replication.left_change_handling,
            ChangeHandling::Replicate
        );
        assert_eq!(
            config.replication.replication_conflict_handling,
            ConflictHandling::Ignore
        );
        assert_eq!(
            config.replication.logged_replication_events,
            vec![LoggedEvent::IgnoredConflicts]
        );
        assert_eq!(config.pending_changes_table(), "rr_pending_changes");
        assert_eq!(config.logged_events_table(), "rr_logged_events");
    }

    #[test]
    fn test_prefix_controls_table_names() {
        let config = SyncConfig::from_str(&minimal_config(
            "[replication]\nprefix = \"rx\"",
        ))
        .unwrap();
        assert_eq!(config.running_flags_table(), "rx_running_flags");
    }

    #[test]
    fn test_handling_options_parse() {
        let config = SyncConfig::from_str(&minimal_config(
            r#"
[replication]
left_change_handling = "ignore"
replication_conflict_handling = "later_wins"

[[table]]
left = "orders"
replication_conflict_handling = "right_wins"
"#,
        ))
        .unwrap();

        assert_eq!(
            config.replication.left_change_handling,
            ChangeHandling::Ignore
        );
        let options = config.options_for_table("orders");
        assert_eq!(
            options.replication_conflict_handling,
            ConflictHandling::RightWins
        );
        // Unset per-table options fall back to the global value
        assert_eq!(options.left_change_handling, ChangeHandling::Ignore);

        let other = config.options_for_table("customers");
        assert_eq!(
            other.replication_conflict_handling,
            ConflictHandling::LaterWins
        );
    }

    #[test]
    fn test_unknown_handling_becomes_custom() {
        let config = SyncConfig::from_str(&minimal_config(
            "[replication]\nleft_change_handling = \"audit_hook\"",
        ))
        .unwrap();
        assert_eq!(
            config.replication.left_change_handling,
            ChangeHandling::Custom("audit_hook".to_string())
        );
    }

    #[test]
    fn test_corresponding_table_mapping() {
        let config = SyncConfig::from_str(&minimal_config(
            "[[table]]\nleft = \"users\"\nright = \"users_mirror\"",
        ))
        .unwrap();
        assert_eq!(
            config.corresponding_table(Side::Left, "users"),
            "users_mirror"
        );
        assert_eq!(
            config.corresponding_table(Side::Right, "users_mirror"),
            "users"
        );
        assert_eq!(config.corresponding_table(Side::Left, "orders"), "orders");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(SyncConfig::from_str(&minimal_config(
            "[replication]\ncommit_frequency = 0"
        ))
        .is_err());
        assert!(SyncConfig::from_str(&minimal_config(
            "[replication]\nkey_sep = \"\""
        ))
        .is_err());
    }

    #[test]
    fn test_sample_config_parses() {
        let config = SyncConfig::from_str(SyncConfig::sample()).unwrap();
        assert_eq!(config.left.database, "app_primary");
        assert_eq!(config.tables.len(), 0);
    }
}
