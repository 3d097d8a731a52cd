//! Bulk transfer engine with a read-ahead pipeline.
//!
//! One reader streams the select from the source connection into a bounded
//! channel while one writer bulk-loads each chunk into the destination on
//! the target connection, so reads and writes overlap. Each job owns exactly
//! one connection per side, hence a single reader and a single writer.

use crate::error::{Result, SyncError};
use crate::source::{RowChunk, SourceDatabase};
use crate::target::TargetDatabase;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What to copy and where.
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Source table, for error context.
    pub table: String,
    /// Human label of the row set ("new or updated", "deleted", "seed").
    pub label: String,
    /// Statement producing the rows.
    pub select_sql: String,
    /// Destination table.
    pub destination: String,
    /// Names of the selected columns, in order.
    pub columns: Vec<String>,
}

/// Statistics from a transfer job.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Time spent reading.
    pub query_time: Duration,

    /// Time spent writing.
    pub write_time: Duration,

    /// Total rows transferred.
    pub rows: i64,
}

/// Transfer tuning.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Rows per bulk load batch, also the progress notification interval.
    pub batch_size: usize,
    /// Chunks buffered between reader and writer.
    pub read_ahead: usize,
    /// Limit for one whole transfer.
    pub timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::schema::DEFAULT_BATCH_SIZE,
            read_ahead: 4,
            timeout: Duration::from_secs(1800),
        }
    }
}

/// Transfer engine for one source/target pair.
pub struct TransferEngine<'a, S: ?Sized, T: ?Sized> {
    source: &'a S,
    target: &'a T,
    config: TransferConfig,
}

impl<'a, S, T> TransferEngine<'a, S, T>
where
    S: SourceDatabase + ?Sized,
    T: TargetDatabase + ?Sized,
{
    pub fn new(source: &'a S, target: &'a T, config: TransferConfig) -> Self {
        Self {
            source,
            target,
            config,
        }
    }

    /// Copy every row of `job.select_sql` into `job.destination`.
    ///
    /// Any read or write fault fails the whole transfer; rows already loaded
    /// stay where they are.
    pub async fn execute(&self, job: &TransferJob) -> Result<TransferStats> {
        let limit = self.config.timeout;
        match tokio::time::timeout(limit, self.run(job)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::transfer(
                &job.table,
                format!("{} rows: timed out after {}s", job.label, limit.as_secs()),
            )),
        }
    }

    async fn run(&self, job: &TransferJob) -> Result<TransferStats> {
        let start = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let (tx, mut rx) = mpsc::channel::<RowChunk>(self.config.read_ahead.max(1));

        let reader = async move {
            let started = Instant::now();
            let rows = self.source.read_chunks(&job.select_sql, batch_size, tx).await?;
            Ok::<_, SyncError>((rows, started.elapsed()))
        };

        let writer = async move {
            let mut write_time = Duration::ZERO;
            let mut query_time = Duration::ZERO;
            let mut total = 0i64;

            while let Some(chunk) = rx.recv().await {
                query_time += chunk.read_time;
                let count = chunk.rows.len() as i64;
                let write_start = Instant::now();
                self.target
                    .bulk_load(&job.destination, &job.columns, chunk.rows)
                    .await?;
                write_time += write_start.elapsed();
                total += count;
                info!("{} {} rows copied", total, job.label);
            }
            Ok::<_, SyncError>((total, query_time, write_time))
        };

        let (read_result, write_result) = tokio::join!(reader, writer);

        // A failed writer drops the receiver, which surfaces in the reader as
        // a secondary error; report the writer's.
        let (rows, query_time, write_time) = write_result
            .map_err(|e| SyncError::transfer(&job.table, format!("{} rows: {}", job.label, e)))?;
        let (read_rows, read_elapsed) = read_result
            .map_err(|e| SyncError::transfer(&job.table, format!("{} rows: {}", job.label, e)))?;

        debug!(
            "{}: read {} {} rows in {:?}",
            job.table, read_rows, job.label, read_elapsed
        );

        let elapsed = start.elapsed();
        let rows_per_sec = if elapsed.as_secs_f64() > 0.0 {
            (rows as f64 / elapsed.as_secs_f64()) as i64
        } else {
            0
        };
        info!(
            "{}: transferred {} {} rows into {} in {:?} ({} rows/sec, read: {:?}, write: {:?})",
            job.table, rows, job.label, job.destination, elapsed, rows_per_sec, query_time, write_time
        );

        Ok(TransferStats {
            query_time,
            write_time,
            rows,
        })
    }
}
