//! SQL Server sync target.

use super::TargetDatabase;
use crate::config::Timeouts;
use crate::core::{catalog, with_timeout, MssqlPool};
use crate::error::{Result, SyncError};
use crate::schema::TableVersion;
use crate::source::SqlRow;
use crate::state::{MssqlVersionStore, VersionStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tiberius::TokenRow;
use tokio::sync::Mutex;
use tracing::debug;

/// Target side of one job: a single pooled connection reused by every
/// table, plus the version store living in the same database.
pub struct MssqlTarget {
    pool: Arc<MssqlPool>,
    versions: MssqlVersionStore,
    timeouts: Timeouts,
    /// Destination table -> indexes into the caller's column list.
    bulk_mappings: Mutex<HashMap<String, Vec<usize>>>,
}

impl MssqlTarget {
    pub fn new(pool: Arc<MssqlPool>, sync_schema: &str, timeouts: Timeouts) -> Result<Self> {
        Ok(Self {
            versions: MssqlVersionStore::new(pool.clone(), sync_schema, timeouts.schema_query)?,
            pool,
            timeouts,
            bulk_mappings: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &MssqlPool {
        &self.pool
    }

    pub async fn db_info(&self) -> Result<catalog::DbInfo> {
        catalog::db_info(&self.pool, self.timeouts.schema_query).await
    }

    pub async fn row_count(&self, table: &str) -> Result<i64> {
        catalog::row_count(&self.pool, table, self.timeouts.schema_query).await
    }

    async fn bulk_mapping(&self, destination: &str, columns: &[String]) -> Result<Vec<usize>> {
        let mut mappings = self.bulk_mappings.lock().await;
        if let Some(mapping) = mappings.get(destination) {
            return Ok(mapping.clone());
        }
        let destination_columns =
            catalog::bulk_columns(&self.pool, destination, self.timeouts.schema_query).await?;
        let mapping = map_columns(&destination_columns, columns)
            .map_err(|e| SyncError::transfer(destination, e))?;
        mappings.insert(destination.to_string(), mapping.clone());
        Ok(mapping)
    }
}

/// For each destination column, the index of the same-named value column.
/// Names compare case-insensitively, matching the server's default collation.
fn map_columns(destination: &[String], columns: &[String]) -> std::result::Result<Vec<usize>, String> {
    if destination.is_empty() {
        return Err("destination has no insertable columns".into());
    }
    destination
        .iter()
        .map(|dest| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(dest))
                .ok_or_else(|| format!("no source value for destination column {}", dest))
        })
        .collect()
}

#[async_trait]
impl VersionStore for MssqlTarget {
    async fn init_schema(&self) -> Result<()> {
        self.versions.init_schema().await
    }

    async fn load_version(&self, table: &str) -> Result<TableVersion> {
        self.versions.load_version(table).await
    }

    async fn save_version(&self, version: &TableVersion) -> Result<()> {
        self.versions.save_version(version).await
    }
}

#[async_trait]
impl TargetDatabase for MssqlTarget {
    async fn resolve_table(&self, table: &str) -> Result<String> {
        catalog::resolve_table(&self.pool, table, self.timeouts.schema_query).await
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        with_timeout("statement", self.timeouts.apply, async {
            let mut conn = self.pool.get_conn().await?;
            conn.execute(sql, &[]).await?;
            conn.release();
            Ok::<_, SyncError>(())
        })
        .await
    }

    async fn query_scalar(&self, sql: &str) -> Result<i64> {
        with_timeout("statement", self.timeouts.apply, async {
            let mut conn = self.pool.get_conn().await?;
            let results = conn.simple_query(sql).await?.into_results().await?;
            conn.release();
            let row = results
                .iter()
                .rev()
                .find_map(|set| set.first())
                .ok_or_else(|| SyncError::Database(tiberius::error::Error::Protocol(
                    "statement returned no result set".into(),
                )))?;
            Ok::<_, SyncError>(row.try_get::<i64, _>(0)?.unwrap_or(0))
        })
        .await
    }

    async fn query_flag(&self, sql: &str) -> Result<bool> {
        with_timeout("check", self.timeouts.schema_query, async {
            let mut conn = self.pool.get_conn().await?;
            let row = conn.simple_query(sql).await?.into_row().await?;
            conn.release();
            Ok::<_, SyncError>(row
                .map(|r| r.try_get::<bool, _>(0))
                .transpose()?
                .flatten()
                .unwrap_or(false))
        })
        .await
    }

    async fn bulk_load(&self, destination: &str, columns: &[String], rows: Vec<SqlRow>) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mapping = self.bulk_mapping(destination, columns).await?;
        let count = rows.len() as u64;

        let mut conn = self.pool.get_conn().await?;
        let mut bulk_load = conn
            .bulk_insert(destination)
            .await
            .map_err(|e| SyncError::transfer(destination, format!("bulk insert init: {}", e)))?;

        for row in rows {
            let mut values: Vec<_> = row.into_iter().map(Some).collect();
            let mut token_row = TokenRow::new();
            for &idx in &mapping {
                let value = values
                    .get_mut(idx)
                    .and_then(Option::take)
                    .ok_or_else(|| SyncError::transfer(destination, "row is shorter than its column list"))?;
                token_row.push(value);
            }
            bulk_load
                .send(token_row)
                .await
                .map_err(|e| SyncError::transfer(destination, format!("bulk insert send: {}", e)))?;
        }

        let result = bulk_load
            .finalize()
            .await
            .map_err(|e| SyncError::transfer(destination, format!("bulk insert finalize: {}", e)))?;
        conn.release();
        debug!(
            "Bulk inserted {} rows into {} (reported: {})",
            count,
            destination,
            result.total()
        );
        Ok(count)
    }

    fn label(&self) -> &str {
        self.pool.label()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_map_columns_by_name() {
        let mapping = map_columns(
            &names(&["Name", "Total"]),
            &names(&["Id", "total", "NAME"]),
        )
        .unwrap();
        assert_eq!(mapping, vec![2, 1]);
    }

    #[test]
    fn test_map_columns_missing_value() {
        let err = map_columns(&names(&["Name", "Region"]), &names(&["Id", "Name"])).unwrap_err();
        assert!(err.contains("Region"));
    }

    #[test]
    fn test_map_columns_empty_destination() {
        assert!(map_columns(&[], &names(&["Id"])).is_err());
    }
}
