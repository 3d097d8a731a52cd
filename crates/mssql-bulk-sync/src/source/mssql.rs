//! SQL Server change tracking source.

use super::{RowChunk, SourceDatabase, SqlRow};
use crate::config::Timeouts;
use crate::core::{catalog, MssqlPool};
use crate::error::{Result, SyncError};
use crate::schema::{Column, TableVersion};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

/// Source side of one job: a single pooled connection reused by every table.
pub struct MssqlSource {
    pool: Arc<MssqlPool>,
    timeouts: Timeouts,
}

impl MssqlSource {
    pub fn new(pool: Arc<MssqlPool>, timeouts: Timeouts) -> Self {
        Self { pool, timeouts }
    }

    pub fn pool(&self) -> &MssqlPool {
        &self.pool
    }

    pub async fn db_info(&self) -> Result<catalog::DbInfo> {
        catalog::db_info(&self.pool, self.timeouts.schema_query).await
    }

    pub async fn change_tracking_tables(&self) -> Result<Vec<catalog::SourceTableChangeTrackingInfo>> {
        catalog::change_tracking_tables(&self.pool, self.timeouts.schema_query).await
    }

    pub async fn row_count(&self, table: &str) -> Result<i64> {
        catalog::row_count(&self.pool, table, self.timeouts.schema_query).await
    }
}

#[async_trait]
impl SourceDatabase for MssqlSource {
    async fn resolve_table(&self, table: &str) -> Result<String> {
        catalog::resolve_table(&self.pool, table, self.timeouts.schema_query).await
    }

    async fn columns(&self, table: &str) -> Result<Vec<Column>> {
        catalog::columns(&self.pool, table, self.timeouts.schema_query).await
    }

    async fn change_tracking_version(&self, table: &str, global: bool) -> Result<TableVersion> {
        catalog::source_version(&self.pool, table, global, self.timeouts.schema_query).await
    }

    async fn read_chunks(
        &self,
        sql: &str,
        chunk_size: usize,
        tx: mpsc::Sender<RowChunk>,
    ) -> Result<u64> {
        let chunk_size = chunk_size.max(1);
        let mut conn = self.pool.get_conn().await?;
        let mut stream = conn.simple_query(sql).await?.into_row_stream();

        let mut total = 0u64;
        let mut rows: Vec<SqlRow> = Vec::with_capacity(chunk_size);
        let mut started = Instant::now();

        while let Some(row) = stream.try_next().await? {
            rows.push(row.into_iter().collect());
            if rows.len() >= chunk_size {
                total += rows.len() as u64;
                let chunk = RowChunk {
                    rows: std::mem::replace(&mut rows, Vec::with_capacity(chunk_size)),
                    read_time: started.elapsed(),
                };
                tx.send(chunk)
                    .await
                    .map_err(|_| SyncError::Transfer {
                        table: self.pool.label().to_string(),
                        message: "row consumer stopped".into(),
                    })?;
                started = Instant::now();
            }
        }

        drop(stream);
        conn.release();

        if !rows.is_empty() {
            total += rows.len() as u64;
            let chunk = RowChunk {
                rows,
                read_time: started.elapsed(),
            };
            tx.send(chunk).await.map_err(|_| SyncError::Transfer {
                table: self.pool.label().to_string(),
                message: "row consumer stopped".into(),
            })?;
        }

        debug!("Read {} rows from {}", total, self.pool.label());
        Ok(total)
    }

    fn label(&self) -> &str {
        self.pool.label()
    }
}
