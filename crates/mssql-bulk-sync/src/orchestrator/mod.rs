//! Sync orchestrator - per-job workflow coordinator.
//!
//! For every table of a job, in order:
//!
//! ```text
//! seed:        TRUNCATE target -> bulk load all rows -> commit version
//! incremental: versions equal?      -> skip
//!              staging tables exist? -> fail (StagingConflict)
//!              create staging -> bulk load new/updated + deleted keys
//!                -> delete -> merge -> (always) drop staging -> commit version
//! ```
//!
//! A failing table is logged and collected; its siblings still run. The
//! version of a table is only committed after its data was applied, so a
//! failed or interrupted table is simply redone by the next run.

mod inspect;
pub mod pools;

pub use inspect::{describe_job, JobSchemaSnapshot, TableSnapshot};
pub use pools::{Connector, MssqlConnector};

use crate::config::SyncSettings;
use crate::error::{Result, SyncError};
use crate::job::{SyncJob, SyncJobTable};
use crate::schema::{IncrementalStatements, TableSchema, TableSchemaInput};
use crate::source::SourceDatabase;
use crate::state::VersionStore;
use crate::target::TargetDatabase;
use crate::transfer::{TransferConfig, TransferEngine, TransferJob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What happened to one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    /// Incremental changes applied.
    Synced,
    /// Truncated and fully reloaded.
    Seeded,
    /// Already at the source version.
    Skipped,
    Failed,
    /// Not attempted because the run was cancelled.
    Cancelled,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Synced => "synced",
            TableStatus::Seeded => "seeded",
            TableStatus::Skipped => "skipped",
            TableStatus::Failed => "failed",
            TableStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-table outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableResult {
    pub source: String,
    pub target: String,
    pub status: TableStatus,

    /// Rows bulk-loaded from the source (new or updated rows, or the seed).
    pub rows_copied: i64,

    /// Deleted keys bulk-loaded from the source.
    pub keys_deleted: i64,

    /// Target rows reported by the merge.
    pub rows_merged: i64,

    /// Target rows removed by the delete step.
    pub rows_deleted: i64,

    /// Source version committed for this table.
    pub version: Option<i64>,

    /// Diffed against a full snapshot instead of the change feed.
    pub full_reconcile: bool,

    pub duration_ms: u64,

    pub error: Option<String>,
}

impl TableResult {
    fn new(table: &SyncJobTable, status: TableStatus) -> Self {
        Self {
            source: table.source.clone(),
            target: table.target.clone(),
            status,
            rows_copied: 0,
            keys_deleted: 0,
            rows_merged: 0,
            rows_deleted: 0,
            version: None,
            full_reconcile: false,
            duration_ms: 0,
            error: None,
        }
    }
}

/// Result of one job invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJobResult {
    pub job_id: String,
    pub area: Option<String>,
    pub schedule: String,
    pub seed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableResult>,
}

impl SyncJobResult {
    pub fn count(&self, status: TableStatus) -> usize {
        self.tables.iter().filter(|t| t.status == status).count()
    }

    pub fn rows_copied(&self) -> i64 {
        self.tables.iter().map(|t| t.rows_copied).sum()
    }
}

/// A finished invocation: the report plus every per-table error.
#[derive(Debug)]
pub struct JobRun {
    pub result: SyncJobResult,
    pub failures: Vec<(String, SyncError)>,
}

impl JobRun {
    /// The report, or the aggregate failure when any table failed.
    /// A run that stopped early on cancellation is [`SyncError::Cancelled`].
    pub fn into_result(self) -> Result<SyncJobResult> {
        if !self.failures.is_empty() {
            return Err(SyncError::JobFailed {
                job: self.result.job_id,
                failures: self.failures,
            });
        }
        if self.result.count(TableStatus::Cancelled) > 0 {
            return Err(SyncError::Cancelled);
        }
        Ok(self.result)
    }
}

/// Runs sync jobs.
pub struct Orchestrator<C = MssqlConnector> {
    connector: C,
    default_batch_size: usize,
    bulk_timeout: Duration,
    sync_schema: String,
    cancel: CancellationToken,
}

impl Orchestrator<MssqlConnector> {
    /// Orchestrator over live SQL Server connections.
    pub fn new(settings: &SyncSettings) -> Self {
        Self::with_connector(MssqlConnector::new(settings), settings)
    }
}

impl<C: Connector> Orchestrator<C> {
    pub fn with_connector(connector: C, settings: &SyncSettings) -> Self {
        Self {
            connector,
            default_batch_size: settings.default_batch_size,
            bulk_timeout: settings.timeouts().bulk,
            sync_schema: settings.sync_schema.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between tables once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Run a job; any table failure fails the job as a whole.
    pub async fn run(&self, job: &SyncJob) -> Result<SyncJobResult> {
        self.execute(job).await?.into_result()
    }

    /// Run a job and report every table's outcome.
    ///
    /// Errors only for problems that stop the whole job: expiry, connecting,
    /// or provisioning the version store. An expired job issues no queries.
    #[instrument(skip_all, fields(job = %job.id, schedule = %job.schedule, seed = job.seed))]
    pub async fn execute(&self, job: &SyncJob) -> Result<JobRun> {
        job.ensure_not_expired()?;

        let started_at = Utc::now();
        info!(
            "Starting sync job {} ({} tables, {} -> {})",
            job.id,
            job.tables.len(),
            job.source_label(),
            job.target_label()
        );

        let source = self.connector.connect_source(job).await?;
        let target = self.connector.connect_target(job).await?;
        target.init_schema().await?;

        let batch_size = job.effective_batch_size(self.default_batch_size);
        let mut tables = Vec::with_capacity(job.tables.len());
        let mut failures = Vec::new();

        for table in &job.tables {
            if self.cancel.is_cancelled() {
                warn!("Cancelled before {}", table.source);
                tables.push(TableResult::new(table, TableStatus::Cancelled));
                continue;
            }

            let started = Instant::now();
            let outcome = self
                .sync_table(&*source, &*target, job, table, batch_size)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(mut result) => {
                    result.duration_ms = duration_ms;
                    tables.push(result);
                }
                Err(e) => {
                    error!(
                        "Job {} ({}) failed to sync {} -> {}: {}",
                        job.id, job.schedule, table.source, table.target, e
                    );
                    let mut result = TableResult::new(table, TableStatus::Failed);
                    result.duration_ms = duration_ms;
                    result.error = Some(e.to_string());
                    tables.push(result);
                    failures.push((table.source.clone(), e));
                }
            }
        }

        let result = SyncJobResult {
            job_id: job.id.clone(),
            area: job.area.clone(),
            schedule: job.schedule.clone(),
            seed: job.seed,
            started_at,
            finished_at: Utc::now(),
            tables,
        };
        info!(
            "Finished sync job {}: {} synced, {} seeded, {} skipped, {} failed, {} rows copied",
            job.id,
            result.count(TableStatus::Synced),
            result.count(TableStatus::Seeded),
            result.count(TableStatus::Skipped),
            result.count(TableStatus::Failed),
            result.rows_copied()
        );
        Ok(JobRun { result, failures })
    }

    fn transfer_config(&self, batch_size: usize) -> TransferConfig {
        TransferConfig {
            batch_size,
            timeout: self.bulk_timeout,
            ..Default::default()
        }
    }

    #[instrument(skip_all, fields(table = %table.source))]
    async fn sync_table<S, T>(
        &self,
        source: &S,
        target: &T,
        job: &SyncJob,
        table: &SyncJobTable,
        batch_size: usize,
    ) -> Result<TableResult>
    where
        S: SourceDatabase + ?Sized,
        T: TargetDatabase + ?Sized,
    {
        let source_name = source.resolve_table(&table.source).await?;
        let target_name = target.resolve_table(&table.target).await?;
        let columns = source.columns(&source_name).await?;
        let source_version = source
            .change_tracking_version(&source_name, job.global_change_tracking)
            .await?;
        let target_version = target.load_version(&target_name).await?;
        debug!("Source {}, target {}", source_version, target_version);

        let schema = TableSchema::new(TableSchemaInput {
            source_table_name: source_name,
            target_table_name: target_name,
            columns,
            source_version,
            target_version,
            batch_size,
            disable_target_identity_insert: table.disable_target_identity_insert,
            sync_schema: self.sync_schema.clone(),
        })?;

        let mut result = TableResult::new(table, TableStatus::Synced);

        if job.seed {
            self.seed(source, target, &schema, &mut result).await?;
            result.status = TableStatus::Seeded;
        } else if schema.is_up_to_date() {
            info!(
                "{} already at version {}, skipping",
                schema.target_table_name, schema.source_version.current_version
            );
            result.status = TableStatus::Skipped;
            result.version = Some(schema.target_version.current_version);
            return Ok(result);
        } else {
            self.incremental(source, target, &schema, &mut result).await?;
        }

        self.commit_version(target, &schema).await?;
        result.version = Some(schema.source_version.current_version);
        Ok(result)
    }

    async fn seed<S, T>(&self, source: &S, target: &T, schema: &TableSchema, result: &mut TableResult) -> Result<()>
    where
        S: SourceDatabase + ?Sized,
        T: TargetDatabase + ?Sized,
    {
        info!(
            "Seeding {} from {} (identity insert: {})",
            schema.target_table_name, schema.source_table_name, schema.identity_insert
        );
        result.full_reconcile = true;

        // The identity path stages through a table of this run's name.
        if schema.identity_insert {
            self.ensure_no_staging(target, schema).await?;
        }

        target
            .execute(&schema.statements.truncate)
            .await
            .map_err(|e| SyncError::apply(&schema.target_table_name, format!("truncate: {}", e)))?;

        let engine = TransferEngine::new(source, target, self.transfer_config(schema.batch_size));

        if !schema.identity_insert {
            let stats = engine
                .execute(&TransferJob {
                    table: schema.source_table_name.clone(),
                    label: "seed".into(),
                    select_sql: schema.statements.select_all.clone(),
                    destination: schema.target_table_name.clone(),
                    columns: schema.column_names(),
                })
                .await?;
            result.rows_copied = stats.rows;
            return Ok(());
        }

        // Bulk loads cannot write identity values, so go through a staging
        // copy and insert from it under IDENTITY_INSERT.
        let seeded = async {
            target
                .execute(&schema.statements.create_seed_staging)
                .await
                .map_err(|e| SyncError::apply(&schema.target_table_name, format!("creating seed staging: {}", e)))?;
            let stats = engine
                .execute(&TransferJob {
                    table: schema.source_table_name.clone(),
                    label: "seed".into(),
                    select_sql: schema.statements.select_all.clone(),
                    destination: schema.new_or_updated_table_name.clone(),
                    columns: schema.column_names(),
                })
                .await?;
            let inserted = target
                .query_scalar(&schema.statements.insert_from_seed_staging)
                .await
                .map_err(|e| SyncError::apply(&schema.target_table_name, format!("insert: {}", e)))?;
            Ok::<_, SyncError>((stats.rows, inserted))
        }
        .await;

        self.drop_staging(target, schema, &[&schema.statements.drop_new_or_updated])
            .await;

        let (copied, inserted) = seeded?;
        info!("{}: inserted {} seeded rows", schema.target_table_name, inserted);
        result.rows_copied = copied;
        result.rows_merged = inserted;
        Ok(())
    }

    async fn incremental<S, T>(
        &self,
        source: &S,
        target: &T,
        schema: &TableSchema,
        result: &mut TableResult,
    ) -> Result<()>
    where
        S: SourceDatabase + ?Sized,
        T: TargetDatabase + ?Sized,
    {
        let statements = schema.incremental()?;
        result.full_reconcile = schema.requires_full_reconcile();

        if schema.baseline_expired() {
            warn!(
                "{} was last synced at version {}, older than the source min valid version {}; reconciling against a full snapshot",
                schema.target_table_name,
                schema.target_version.current_version,
                schema.source_version.min_valid_version
            );
        } else if schema.never_synced() {
            info!(
                "{} was never synced; reconciling against a full snapshot",
                schema.target_table_name
            );
        }

        match target.query_scalar(&schema.statements.leftover_staging_count).await {
            Ok(0) => {}
            Ok(count) => warn!(
                "{} staging table(s) from earlier runs of {} are still present",
                count, schema.target_table_name
            ),
            Err(e) => warn!("Could not count leftover staging tables: {}", e),
        }

        self.ensure_no_staging(target, schema).await?;

        let applied = self
            .apply_staged(source, target, schema, statements, result)
            .await;

        self.drop_staging(
            target,
            schema,
            &[
                &schema.statements.drop_new_or_updated,
                &schema.statements.drop_deleted,
            ],
        )
        .await;

        applied
    }

    async fn apply_staged<S, T>(
        &self,
        source: &S,
        target: &T,
        schema: &TableSchema,
        statements: &IncrementalStatements,
        result: &mut TableResult,
    ) -> Result<()>
    where
        S: SourceDatabase + ?Sized,
        T: TargetDatabase + ?Sized,
    {
        let table = &schema.target_table_name;
        for sql in [&statements.create_new_or_updated, &statements.create_deleted] {
            target
                .execute(sql)
                .await
                .map_err(|e| SyncError::apply(table, format!("creating staging table: {}", e)))?;
        }

        let engine = TransferEngine::new(source, target, self.transfer_config(schema.batch_size));
        let copied = engine
            .execute(&TransferJob {
                table: schema.source_table_name.clone(),
                label: "new or updated".into(),
                select_sql: statements.select_new_or_updated.clone(),
                destination: schema.new_or_updated_table_name.clone(),
                columns: schema.column_names(),
            })
            .await?;
        let deleted_keys = engine
            .execute(&TransferJob {
                table: schema.source_table_name.clone(),
                label: "deleted".into(),
                select_sql: statements.select_deleted.clone(),
                destination: schema.deleted_table_name.clone(),
                columns: schema.primary_key_names(),
            })
            .await?;
        result.rows_copied = copied.rows;
        result.keys_deleted = deleted_keys.rows;

        result.rows_deleted = target
            .query_scalar(&statements.delete)
            .await
            .map_err(|e| SyncError::apply(table, format!("delete: {}", e)))?;
        result.rows_merged = target
            .query_scalar(&statements.merge)
            .await
            .map_err(|e| SyncError::apply(table, format!("merge: {}", e)))?;

        info!(
            "{}: {} rows staged, {} keys staged, {} deleted, {} merged",
            table, result.rows_copied, result.keys_deleted, result.rows_deleted, result.rows_merged
        );
        Ok(())
    }

    async fn ensure_no_staging<T>(&self, target: &T, schema: &TableSchema) -> Result<()>
    where
        T: TargetDatabase + ?Sized,
    {
        if target.query_flag(&schema.statements.staging_exists).await? {
            return Err(SyncError::StagingConflict {
                table: schema.target_table_name.clone(),
                new_or_updated: schema.new_or_updated_table_name.clone(),
                deleted: schema.deleted_table_name.clone(),
            });
        }
        Ok(())
    }

    /// Best effort: a failed drop is logged, never returned.
    async fn drop_staging<T>(&self, target: &T, schema: &TableSchema, statements: &[&String])
    where
        T: TargetDatabase + ?Sized,
    {
        for sql in statements {
            if let Err(e) = target.execute(sql).await {
                warn!(
                    "Failed to drop staging table for {}: {}",
                    schema.target_table_name, e
                );
            }
        }
    }

    async fn commit_version<T>(&self, target: &T, schema: &TableSchema) -> Result<()>
    where
        T: TargetDatabase + ?Sized,
    {
        let synced = schema.source_version.renamed(&schema.target_table_name);
        target.save_version(&synced).await?;
        info!("Committed {}", synced);
        Ok(())
    }
}
