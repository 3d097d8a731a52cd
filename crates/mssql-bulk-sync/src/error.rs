//! Error types for the sync engine.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database driver error (connection, login, query)
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// Connection could not be established or checked out
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// Table or column metadata unavailable
    #[error("Schema query failed for table {table}: {message}")]
    SchemaQuery { table: String, message: String },

    /// Change tracking not enabled, or the version anchor query failed
    #[error("Version query failed for table {table}: {message}")]
    VersionQuery { table: String, message: String },

    /// Incremental sync requires a primary key to join staged rows
    #[error("Table {0} has no primary key - incremental sync requires primary keys")]
    NoPrimaryKey(String),

    /// Staging tables for this run already exist on the target
    #[error("Staging tables already exist for table {table} ({new_or_updated}, {deleted}) - a previous run did not clean up or is still running")]
    StagingConflict {
        table: String,
        new_or_updated: String,
        deleted: String,
    },

    /// Bulk load failed
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Merge or delete against the target failed
    #[error("Apply failed for table {table}: {message}")]
    Apply { table: String, message: String },

    /// Version commit did not read back what was written
    #[error("Failed to persist version for table {table}: wrote {expected}, read back {actual}")]
    Persist {
        table: String,
        expected: String,
        actual: String,
    },

    /// Job was delivered after its expiry
    #[error("Job {job} expired at {expires}")]
    Expired { job: String, expires: DateTime<Utc> },

    /// Access token acquisition failed
    #[error("Token acquisition failed for tenant {tenant}: {message}")]
    Token { tenant: String, message: String },

    /// A database operation exceeded its timeout
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// One or more tables of a job failed
    #[error("Job {job} failed for {} table(s):\n{}", .failures.len(), format_failures(.failures))]
    JobFailed {
        job: String,
        failures: Vec<(String, SyncError)>,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job queue closed before the job could be delivered
    #[error("Job queue error: {0}")]
    Queue(String),

    /// Sync was cancelled (SIGINT, etc.)
    #[error("Sync cancelled")]
    Cancelled,
}

fn format_failures(failures: &[(String, SyncError)]) -> String {
    failures
        .iter()
        .map(|(table, err)| format!("  - {}: {}", table, err))
        .collect::<Vec<_>>()
        .join("\n")
}

impl SyncError {
    /// Create a Connection error with context about where it occurred
    pub fn connection(message: impl ToString, context: impl Into<String>) -> Self {
        SyncError::Connection {
            message: message.to_string(),
            context: context.into(),
        }
    }

    pub fn schema_query(table: impl Into<String>, message: impl ToString) -> Self {
        SyncError::SchemaQuery {
            table: table.into(),
            message: message.to_string(),
        }
    }

    pub fn version_query(table: impl Into<String>, message: impl ToString) -> Self {
        SyncError::VersionQuery {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Transfer {
            table: table.into(),
            message: message.to_string(),
        }
    }

    pub fn apply(table: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Apply {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Soft errors are logged and discarded rather than reported as failures.
    pub fn is_soft(&self) -> bool {
        matches!(self, SyncError::Expired { .. })
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) => 2,
            SyncError::Connection { .. } | SyncError::Database(_) | SyncError::Token { .. } => 3,
            SyncError::JobFailed { .. } => 4,
            SyncError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
