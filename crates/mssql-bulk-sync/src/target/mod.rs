//! Target database operations.

mod mssql;

pub use mssql::MssqlTarget;

use crate::error::Result;
use crate::source::SqlRow;
use crate::state::VersionStore;
use async_trait::async_trait;

/// Trait for target database operations.
///
/// Every target also hosts the version store for the tables it receives.
#[async_trait]
pub trait TargetDatabase: VersionStore {
    /// Canonical `[schema].[table]` name of a configured table.
    async fn resolve_table(&self, table: &str) -> Result<String>;

    /// Run a statement that returns nothing (DDL, truncate, drop).
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Run a statement whose last result set is a single `bigint`
    /// (row counts reported by merge, delete and insert).
    async fn query_scalar(&self, sql: &str) -> Result<i64>;

    /// Run a statement whose first result is a single `bit`.
    async fn query_flag(&self, sql: &str) -> Result<bool>;

    /// Bulk load `rows` into `destination`.
    ///
    /// `columns` names the values of each row, in order; they are mapped by
    /// name onto the destination's insertable columns.
    async fn bulk_load(&self, destination: &str, columns: &[String], rows: Vec<SqlRow>) -> Result<u64>;

    /// `server/database` label for logs.
    fn label(&self) -> &str;
}
