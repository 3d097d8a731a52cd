//! Source database operations.
//!
//! The orchestrator only talks to the source through [`SourceDatabase`], so
//! tests can drive it with in-memory fakes.

mod mssql;

pub use mssql::MssqlSource;

use crate::error::Result;
use crate::schema::{Column, TableVersion};
use async_trait::async_trait;
use std::time::Duration;
use tiberius::ColumnData;
use tokio::sync::mpsc;

/// One row, in column order of the query that produced it.
pub type SqlRow = Vec<ColumnData<'static>>;

/// A batch of rows read from the source.
#[derive(Debug)]
pub struct RowChunk {
    pub rows: Vec<SqlRow>,
    /// Time taken to read this chunk.
    pub read_time: Duration,
}

/// Trait for source database operations.
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    /// Canonical `[schema].[table]` name of a configured table.
    async fn resolve_table(&self, table: &str) -> Result<String>;

    /// Ordered, non-computed columns of a table.
    async fn columns(&self, table: &str) -> Result<Vec<Column>>;

    /// Current change tracking version, database-wide when `global`.
    async fn change_tracking_version(&self, table: &str, global: bool) -> Result<TableVersion>;

    /// Run `sql` and stream its rows into `tx` in chunks of `chunk_size`.
    ///
    /// Returns the number of rows read. Stops early with an error if the
    /// receiver goes away.
    async fn read_chunks(
        &self,
        sql: &str,
        chunk_size: usize,
        tx: mpsc::Sender<RowChunk>,
    ) -> Result<u64>;

    /// `server/database` label for logs.
    fn label(&self) -> &str;
}
