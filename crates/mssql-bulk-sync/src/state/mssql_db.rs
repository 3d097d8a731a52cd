//! MSSQL-backed version store, living in the target database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tiberius::Row;
use tracing::{info, warn};

use crate::core::identifier::{qualify_mssql, quote_mssql, string_literal};
use crate::core::{with_timeout, MssqlPool};
use crate::error::{Result, SyncError};
use crate::schema::TableVersion;
use crate::state::backend::{same_version, VersionStore};

const VERSION_TABLE: &str = "TableVersion";

/// Server error numbers raised when a concurrent provisioning run created
/// the object between our check and our create.
const ALREADY_EXISTS_CODES: [u32; 3] = [2714, 1913, 2759];

/// Version store in `[<sync schema>].[TableVersion]`.
pub struct MssqlVersionStore {
    pool: Arc<MssqlPool>,
    schema: String,
    /// `[schema].[TableVersion]`
    table: String,
    timeout: Duration,
}

impl MssqlVersionStore {
    pub fn new(pool: Arc<MssqlPool>, schema: impl Into<String>, timeout: Duration) -> Result<Self> {
        let schema = schema.into();
        let table = qualify_mssql(&schema, VERSION_TABLE)?;
        Ok(Self {
            pool,
            schema,
            table,
            timeout,
        })
    }

    async fn provision(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let results = conn
            .simple_query(provision_sql(&self.schema)?)
            .await?
            .into_results()
            .await?;
        conn.release();
        Ok(results
            .iter()
            .filter_map(|set| set.first())
            .filter_map(|row| row.try_get::<&str, _>(0).ok().flatten().map(str::to_string))
            .collect())
    }
}

/// Check-then-create script for the schema, the version table and its index.
/// Emits one message row per step.
fn provision_sql(schema: &str) -> Result<String> {
    let quoted_schema = quote_mssql(schema)?;
    let table = qualify_mssql(schema, VERSION_TABLE)?;
    let index = format!("IX_{}_{}_TableName", schema, VERSION_TABLE);
    let quoted_index = quote_mssql(&index)?;

    Ok(format!(
        "IF NOT EXISTS (SELECT * FROM sys.schemas WHERE name = {schema_literal})
BEGIN
    EXEC sys.sp_executesql {create_schema};
    SELECT N'Schema {schema} created' AS Message;
END
ELSE
    SELECT N'Schema {schema} exists' AS Message;

IF NOT EXISTS (SELECT * FROM sys.objects WHERE object_id = OBJECT_ID({table_literal}) AND type IN (N'U'))
BEGIN
    CREATE TABLE {table} (
        Id              bigint IDENTITY(1,1)    NOT NULL PRIMARY KEY,
        TableName       nvarchar(256)           NOT NULL,
        CurrentVersion  bigint                  NOT NULL,
        MinValidVersion bigint                  NOT NULL,
        Queried         datetimeoffset(7)       NOT NULL,
        Updated         datetimeoffset(7)       NOT NULL,
        Created         datetimeoffset(7)       NOT NULL
    );
    SELECT N'Table {schema}.{version_table} created' AS Message;
END
ELSE
    SELECT N'Table {schema}.{version_table} exists' AS Message;

IF NOT EXISTS (SELECT * FROM sys.indexes WHERE object_id = OBJECT_ID({table_literal}) AND name = {index_literal})
BEGIN
    CREATE NONCLUSTERED INDEX {quoted_index} ON {table} (TableName ASC)
        INCLUDE (CurrentVersion, MinValidVersion, Queried);
    SELECT N'Index {index} created' AS Message;
END
ELSE
    SELECT N'Index {index} exists' AS Message;",
        schema_literal = string_literal(schema),
        create_schema = string_literal(&format!("CREATE SCHEMA {}", quoted_schema)),
        schema = schema.replace('\'', "''"),
        table_literal = string_literal(&table),
        table = table,
        version_table = VERSION_TABLE,
        index_literal = string_literal(&index),
        quoted_index = quoted_index,
        index = index.replace('\'', "''"),
    ))
}

fn is_already_exists(err: &SyncError) -> bool {
    match err {
        SyncError::Database(e) => e.code().is_some_and(|c| ALREADY_EXISTS_CODES.contains(&c)),
        _ => false,
    }
}

fn version_from_row(row: &Row, table: &str) -> Result<TableVersion> {
    let ctx = |e: tiberius::error::Error| SyncError::version_query(table, e);
    Ok(TableVersion {
        table_name: row
            .try_get::<&str, _>(0)
            .map_err(ctx)?
            .unwrap_or(table)
            .to_string(),
        current_version: row.try_get::<i64, _>(1).map_err(ctx)?.unwrap_or_default(),
        min_valid_version: row.try_get::<i64, _>(2).map_err(ctx)?.unwrap_or_default(),
        queried: row.try_get::<DateTime<Utc>, _>(3).map_err(ctx)?,
    })
}

#[async_trait]
impl VersionStore for MssqlVersionStore {
    async fn init_schema(&self) -> Result<()> {
        let messages = match with_timeout("provisioning version store", self.timeout, self.provision()).await {
            Err(e) if is_already_exists(&e) => {
                warn!("Version store provisioned concurrently, re-checking: {}", e);
                with_timeout("provisioning version store", self.timeout, self.provision()).await?
            }
            other => other?,
        };
        for message in messages {
            info!("{} on {}", message, self.pool.label());
        }
        Ok(())
    }

    async fn load_version(&self, table: &str) -> Result<TableVersion> {
        let sql = format!(
            "SELECT  TOP 1 TableName,
        CurrentVersion,
        MinValidVersion,
        Queried
    FROM {}
    WHERE TableName = @P1
    ORDER BY Updated DESC",
            self.table
        );

        let row = with_timeout("reading target version", self.timeout, async {
            let mut conn = self.pool.get_conn().await?;
            let row = conn.query(sql.as_str(), &[&table]).await?.into_row().await?;
            conn.release();
            Ok::<_, SyncError>(row)
        })
        .await
        .map_err(|e| SyncError::version_query(table, e))?;

        match row {
            Some(row) => version_from_row(&row, table),
            None => Ok(TableVersion::never_synced(table)),
        }
    }

    async fn save_version(&self, version: &TableVersion) -> Result<()> {
        let sql = format!(
            "MERGE {} AS target
USING (
    SELECT  @P1                                     AS TableName,
            @P2                                     AS CurrentVersion,
            @P3                                     AS MinValidVersion,
            COALESCE(@P4, SYSDATETIMEOFFSET())      AS Queried,
            SYSDATETIMEOFFSET()                     AS Updated,
            SYSDATETIMEOFFSET()                     AS Created
) AS source
ON target.TableName = source.TableName
WHEN NOT MATCHED BY TARGET
    THEN INSERT (TableName, CurrentVersion, MinValidVersion, Queried, Updated, Created)
        VALUES (source.TableName, source.CurrentVersion, source.MinValidVersion,
                source.Queried, source.Updated, source.Created)
WHEN MATCHED
    THEN UPDATE
        SET CurrentVersion  = source.CurrentVersion,
            MinValidVersion = source.MinValidVersion,
            Queried         = source.Queried,
            Updated         = source.Updated
OUTPUT  inserted.TableName,
        inserted.CurrentVersion,
        inserted.MinValidVersion,
        inserted.Queried;",
            self.table
        );

        let table = version.table_name.as_str();
        let row = with_timeout("persisting target version", self.timeout, async {
            let mut conn = self.pool.get_conn().await?;
            let row = conn
                .query(
                    sql.as_str(),
                    &[
                        &table,
                        &version.current_version,
                        &version.min_valid_version,
                        &version.queried,
                    ],
                )
                .await?
                .into_row()
                .await?;
            conn.release();
            Ok::<_, SyncError>(row)
        })
        .await?;

        let stored = match row {
            Some(row) => version_from_row(&row, table)?,
            None => TableVersion::never_synced(table),
        };

        if !same_version(version, &stored) {
            return Err(SyncError::Persist {
                table: table.to_string(),
                expected: version.to_string(),
                actual: stored.to_string(),
            });
        }
        Ok(())
    }
}
