//! Twinsync Error Types

use thiserror::Error;

/// Result type alias for twinsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Twinsync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Not connected to {0} database")]
    NotConnected(&'static str),

    // Change log errors
    #[error("Unknown change type '{0}' in change log")]
    UnknownChangeType(String),

    #[error("Malformed change key '{0}'")]
    MalformedKey(String),

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("max replication attempts exceeded")]
    MaxReplicationAttempts,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Kinds of database constraint violations that replication can recover from.
///
/// Detection is message-pattern based. The wording differs per server and
/// driver, so all matching is concentrated here; the retry logic never looks
/// at error text itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintViolation {
    /// Unique/primary key violated (row appeared on the target concurrently)
    Unique,
    /// Foreign key violated (referencing row appeared or is still present)
    ForeignKey,
}

impl Error {
    /// Classify this error as a constraint violation, if it is one.
    pub fn constraint_violation(&self) -> Option<ConstraintViolation> {
        let message = self.to_string().to_lowercase();
        if message.contains("foreign key constraint fails")
            || message.contains("violates foreign key constraint")
        {
            Some(ConstraintViolation::ForeignKey)
        } else if message.contains("duplicate entry")
            || message.contains("duplicate key")
            || message.contains("unique constraint")
        {
            Some(ConstraintViolation::Unique)
        } else {
            None
        }
    }
}
