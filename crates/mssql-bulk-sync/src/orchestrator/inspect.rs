//! Read-only schema inspection of a job's databases.

use super::pools::{Connector, MssqlConnector};
use crate::core::catalog::{DbInfo, SourceTableChangeTrackingInfo};
use crate::error::Result;
use crate::job::{SyncJob, SyncJobTable};
use crate::schema::{Column, TableVersion};
use crate::source::SourceDatabase;
use crate::state::VersionStore;
use crate::target::TargetDatabase;
use serde::Serialize;
use tracing::{info, warn};

/// What the sync would see for one table right now.
#[derive(Debug, Clone, Serialize)]
pub struct TableSnapshot {
    pub source: String,
    pub target: String,
    pub source_table_name: Option<String>,
    pub target_table_name: Option<String>,
    pub source_version: Option<TableVersion>,
    pub target_version: Option<TableVersion>,
    pub columns: Vec<Column>,
    pub source_row_count: Option<i64>,
    pub target_row_count: Option<i64>,
    /// Lookups that failed; the rest of the snapshot is still filled in.
    pub errors: Vec<String>,
}

/// Source and target metadata of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSchemaSnapshot {
    pub job_id: String,
    pub source: DbInfo,
    pub target: DbInfo,
    pub change_tracking_tables: Vec<SourceTableChangeTrackingInfo>,
    pub tables: Vec<TableSnapshot>,
}

/// Connect to both sides of `job` and snapshot its tables.
///
/// Provisions the version store on the target if it is missing; writes
/// nothing else.
pub async fn describe_job(connector: &MssqlConnector, job: &SyncJob) -> Result<JobSchemaSnapshot> {
    let source = connector.connect_source(job).await?;
    let target = connector.connect_target(job).await?;
    target.init_schema().await?;

    let source_info = source.db_info().await?;
    let target_info = target.db_info().await?;
    let change_tracking_tables = source.change_tracking_tables().await?;
    if !source_info.is_change_tracking_database {
        warn!("Change tracking is not enabled on {}", source.label());
    }

    let mut tables = Vec::with_capacity(job.tables.len());
    for table in &job.tables {
        let mut snapshot = describe_table(&*source, &*target, job, table).await;
        if let Some(name) = snapshot.source_table_name.clone() {
            match source.row_count(&name).await {
                Ok(count) => snapshot.source_row_count = Some(count),
                Err(e) => snapshot.errors.push(e.to_string()),
            }
        }
        if let Some(name) = snapshot.target_table_name.clone() {
            match target.row_count(&name).await {
                Ok(count) => snapshot.target_row_count = Some(count),
                Err(e) => snapshot.errors.push(e.to_string()),
            }
        }
        tables.push(snapshot);
    }

    info!("Inspected {} tables of job {}", tables.len(), job.id);
    Ok(JobSchemaSnapshot {
        job_id: job.id.clone(),
        source: source_info,
        target: target_info,
        change_tracking_tables,
        tables,
    })
}

/// Names, columns and versions of one table. Never fails; lookup errors
/// are recorded in the snapshot.
pub(crate) async fn describe_table<S, T>(
    source: &S,
    target: &T,
    job: &SyncJob,
    table: &SyncJobTable,
) -> TableSnapshot
where
    S: SourceDatabase + ?Sized,
    T: TargetDatabase + ?Sized,
{
    let mut snapshot = TableSnapshot {
        source: table.source.clone(),
        target: table.target.clone(),
        source_table_name: None,
        target_table_name: None,
        source_version: None,
        target_version: None,
        columns: Vec::new(),
        source_row_count: None,
        target_row_count: None,
        errors: Vec::new(),
    };

    match source.resolve_table(&table.source).await {
        Ok(name) => {
            match source.columns(&name).await {
                Ok(columns) => snapshot.columns = columns,
                Err(e) => snapshot.errors.push(e.to_string()),
            }
            match source
                .change_tracking_version(&name, job.global_change_tracking)
                .await
            {
                Ok(version) => snapshot.source_version = Some(version),
                Err(e) => snapshot.errors.push(e.to_string()),
            }
            snapshot.source_table_name = Some(name);
        }
        Err(e) => snapshot.errors.push(e.to_string()),
    }

    match target.resolve_table(&table.target).await {
        Ok(name) => {
            match target.load_version(&name).await {
                Ok(version) => snapshot.target_version = Some(version),
                Err(e) => snapshot.errors.push(e.to_string()),
            }
            snapshot.target_table_name = Some(name);
        }
        Err(e) => snapshot.errors.push(e.to_string()),
    }

    snapshot
}
