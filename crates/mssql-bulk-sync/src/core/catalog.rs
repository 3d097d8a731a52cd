//! Catalog and change tracking queries.
//!
//! Configured table names only ever reach SQL Server as `@P1` parameters;
//! the canonical `[schema].[table]` text returned by [`resolve_table`] is what
//! later gets spliced into generated statements.

use crate::core::identifier::string_literal;
use crate::core::pool::{with_timeout, MssqlPool};
use crate::error::{Result, SyncError};
use crate::schema::{Column, TableVersion};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tiberius::Row;

const RESOLVE_TABLE_SQL: &str = "SELECT  QUOTENAME(s.name) + N'.' + QUOTENAME(t.name) AS TableName
    FROM sys.tables t
        INNER JOIN sys.schemas s ON s.schema_id = t.schema_id
    WHERE t.object_id = OBJECT_ID(@P1, N'U')";

/// Non-computed, non-rowversion columns with type, identity, key,
/// nullability and collation. Alias types are reported as their base type.
const COLUMNS_SQL: &str = "SELECT  c.name                  AS Name,
        tn.Type                 AS Type,
        c.is_identity           AS IsIdentity,
        tn.IsPrimary            AS IsPrimary,
        c.is_nullable           AS IsNullable,
        QUOTENAME(c.name)       AS QuoteName,
        c.collation_name        AS Collation
    FROM sys.columns c
        INNER JOIN sys.types ut ON ut.user_type_id = c.user_type_id
        LEFT JOIN sys.types bt ON bt.user_type_id = c.system_type_id
                              AND ut.is_user_defined = 1
                              AND ut.is_assembly_type = 0
                              AND ut.is_table_type = 0
        CROSS APPLY (SELECT COALESCE(bt.name, ut.name) AS BaseType) b
        CROSS APPLY (
            SELECT CASE
                        WHEN b.BaseType IN (N'nvarchar', N'nchar')
                            THEN b.BaseType + N'(' +
                                CASE c.max_length WHEN -1 THEN N'max'
                                     ELSE CAST(c.max_length / 2 AS nvarchar(10)) END + N')'
                        WHEN b.BaseType IN (N'varchar', N'char', N'varbinary', N'binary')
                            THEN b.BaseType + N'(' +
                                CASE c.max_length WHEN -1 THEN N'max'
                                     ELSE CAST(c.max_length AS nvarchar(10)) END + N')'
                        WHEN b.BaseType IN (N'decimal', N'numeric')
                            THEN b.BaseType + N'(' + CAST(c.precision AS nvarchar(10)) +
                                N', ' + CAST(c.scale AS nvarchar(10)) + N')'
                        WHEN b.BaseType IN (N'datetime2', N'time', N'datetimeoffset')
                            THEN b.BaseType + N'(' + CAST(c.scale AS nvarchar(10)) + N')'
                        ELSE b.BaseType
                    END AS Type,
                    CAST(CASE WHEN EXISTS (
                            SELECT 1
                                FROM sys.indexes i
                                    INNER JOIN sys.index_columns ic ON ic.object_id = i.object_id
                                                                   AND ic.index_id = i.index_id
                                                                   AND ic.column_id = c.column_id
                                WHERE i.is_primary_key = 1
                                  AND i.object_id = c.object_id
                        ) THEN 1 ELSE 0 END AS bit) AS IsPrimary
        ) tn
    WHERE c.object_id = OBJECT_ID(@P1)
      AND c.is_computed = 0
      AND b.BaseType NOT IN (N'timestamp', N'rowversion')
    ORDER BY c.column_id";

/// Columns a bulk load writes, in table order. Identity, computed and
/// rowversion columns are assigned by the server.
const BULK_COLUMNS_SQL: &str = "SELECT  c.name
    FROM sys.columns c
        INNER JOIN sys.types tp ON tp.user_type_id = c.system_type_id
    WHERE c.object_id = OBJECT_ID(@P1)
      AND c.is_computed = 0
      AND c.is_identity = 0
      AND tp.name NOT IN (N'timestamp', N'rowversion')
    ORDER BY c.column_id";

const GLOBAL_VERSION_SQL: &str = "SELECT  CAST(CHANGE_TRACKING_CURRENT_VERSION() AS bigint)                    AS CurrentVersion,
        CAST(CHANGE_TRACKING_MIN_VALID_VERSION(OBJECT_ID(@P1)) AS bigint)       AS MinValidVersion,
        SYSDATETIMEOFFSET()                                                     AS Queried";

const DB_INFO_SQL: &str = "SELECT  CAST(SERVERPROPERTY('ServerName') AS nvarchar(256))                     AS ServerName,
        CAST(DB_NAME() AS nvarchar(256))                                            AS DatabaseName,
        CAST(CASE WHEN ctd.database_id IS NULL THEN 0 ELSE 1 END AS bit)            AS IsChangeTrackingDatabase,
        CAST(ISNULL(ctd.is_auto_cleanup_on, 0) AS bit)                              AS IsAutoCleanupOn,
        ctd.retention_period                                                        AS RetentionPeriod,
        CAST(ctd.retention_period_units_desc AS nvarchar(60))                       AS RetentionPeriodUnit,
        CAST(SERVERPROPERTY('ProductVersion') AS nvarchar(128))                     AS ServerVersion
    FROM (SELECT DB_ID() AS database_id) d
        LEFT JOIN sys.change_tracking_databases ctd ON ctd.database_id = d.database_id";

const CHANGE_TRACKING_TABLES_SQL: &str = "SELECT  ctt.object_id                                         AS TableObjectId,
        CAST(SCHEMA_NAME(t.schema_id) AS nvarchar(128))       AS SchemaName,
        CAST(t.name AS nvarchar(128))                         AS TableName,
        ctt.is_track_columns_updated_on                       AS TrackColumnsUpdated,
        CAST(ctt.min_valid_version AS bigint)                 AS MinValidVersion,
        CAST(CHANGE_TRACKING_CURRENT_VERSION() AS bigint)     AS CurrentDatabaseVersion
    FROM sys.change_tracking_tables ctt
        INNER JOIN sys.tables t ON t.object_id = ctt.object_id
    ORDER BY SchemaName, TableName";

const ROW_COUNT_SQL: &str = "SELECT  CAST(ISNULL(SUM(p.rows), 0) AS bigint) AS [RowCount]
    FROM sys.partitions p
    WHERE p.object_id = OBJECT_ID(@P1)
      AND p.index_id IN (0, 1)";

/// Database-level metadata shown by schema inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbInfo {
    pub server_name: Option<String>,
    pub database_name: Option<String>,
    pub is_change_tracking_database: bool,
    pub is_auto_cleanup_on: bool,
    pub retention_period: Option<i32>,
    pub retention_period_unit: Option<String>,
    pub server_version: Option<String>,
}

/// Change tracking state of one source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTableChangeTrackingInfo {
    pub table_object_id: i32,
    pub schema_name: String,
    pub table_name: String,
    pub track_columns_updated: bool,
    pub min_valid_version: i64,
    pub current_database_version: Option<i64>,
}

/// Per-table version query: the newest change retained for the table
/// (deletes included), falling back to its min valid version when nothing
/// changed since.
///
/// Once cleanup has purged every change row, an idle table reads exactly
/// like one whose changes were purged, so a stored version below min valid
/// always forces a full reconcile even if nothing changed. An idle table
/// pays that once per retention period.
pub fn table_version_sql(table: &str) -> String {
    format!(
        "DECLARE @MinValidVersion bigint = CHANGE_TRACKING_MIN_VALID_VERSION(OBJECT_ID({literal}));
IF @MinValidVersion IS NULL
    SELECT  CAST(NULL AS bigint)    AS CurrentVersion,
            @MinValidVersion        AS MinValidVersion,
            SYSDATETIMEOFFSET()     AS Queried;
ELSE
    SELECT  CAST(COALESCE(MAX(ct.SYS_CHANGE_VERSION), @MinValidVersion) AS bigint)  AS CurrentVersion,
            @MinValidVersion                                                        AS MinValidVersion,
            SYSDATETIMEOFFSET()                                                     AS Queried
        FROM CHANGETABLE(CHANGES {table}, @MinValidVersion) AS ct;",
        literal = string_literal(table),
        table = table
    )
}

async fn query_rows(pool: &MssqlPool, sql: &str, param: Option<&str>) -> Result<Vec<Row>> {
    let mut conn = pool.get_conn().await?;
    let stream = match param {
        Some(p) => conn.query(sql, &[&p]).await?,
        None => conn.simple_query(sql).await?,
    };
    let rows = stream.into_first_result().await?;
    conn.release();
    Ok(rows)
}

fn get_string(row: &Row, idx: usize) -> std::result::Result<Option<String>, tiberius::error::Error> {
    Ok(row.try_get::<&str, _>(idx)?.map(str::to_string))
}

fn required<T>(value: Option<T>, what: &str) -> std::result::Result<T, String> {
    value.ok_or_else(|| format!("{} is NULL", what))
}

/// Resolve a configured table name to its catalog `[schema].[table]` form.
pub async fn resolve_table(pool: &MssqlPool, table: &str, timeout: Duration) -> Result<String> {
    let rows = with_timeout(
        &format!("resolving {}", table),
        timeout,
        query_rows(pool, RESOLVE_TABLE_SQL, Some(table)),
    )
    .await
    .map_err(|e| SyncError::schema_query(table, e))?;

    rows.first()
        .map(|row| get_string(row, 0))
        .transpose()
        .map_err(|e| SyncError::schema_query(table, e))?
        .flatten()
        .ok_or_else(|| {
            SyncError::schema_query(table, format!("table not found on {}", pool.label()))
        })
}

/// Ordered column metadata for a table.
pub async fn columns(pool: &MssqlPool, table: &str, timeout: Duration) -> Result<Vec<Column>> {
    let rows = with_timeout(
        &format!("reading columns of {}", table),
        timeout,
        query_rows(pool, COLUMNS_SQL, Some(table)),
    )
    .await
    .map_err(|e| SyncError::schema_query(table, e))?;

    let columns = rows
        .iter()
        .map(column_from_row)
        .collect::<std::result::Result<Vec<_>, String>>()
        .map_err(|e| SyncError::schema_query(table, e))?;

    if columns.is_empty() {
        return Err(SyncError::schema_query(table, "no columns found"));
    }
    Ok(columns)
}

fn column_from_row(row: &Row) -> std::result::Result<Column, String> {
    let to_msg = |e: tiberius::error::Error| e.to_string();
    Ok(Column {
        name: required(get_string(row, 0).map_err(to_msg)?, "Name")?,
        data_type: required(get_string(row, 1).map_err(to_msg)?, "Type")?,
        is_identity: row.try_get::<bool, _>(2).map_err(to_msg)?.unwrap_or(false),
        is_primary: row.try_get::<bool, _>(3).map_err(to_msg)?.unwrap_or(false),
        is_nullable: row.try_get::<bool, _>(4).map_err(to_msg)?.unwrap_or(true),
        quoted_name: required(get_string(row, 5).map_err(to_msg)?, "QuoteName")?,
        collation: get_string(row, 6).map_err(to_msg)?,
    })
}

/// Names of the columns a bulk load into `table` must supply, in order.
pub async fn bulk_columns(pool: &MssqlPool, table: &str, timeout: Duration) -> Result<Vec<String>> {
    let rows = with_timeout(
        &format!("reading bulk columns of {}", table),
        timeout,
        query_rows(pool, BULK_COLUMNS_SQL, Some(table)),
    )
    .await
    .map_err(|e| SyncError::transfer(table, e))?;

    rows.iter()
        .map(|row| {
            get_string(row, 0)
                .map_err(|e| SyncError::transfer(table, e))?
                .ok_or_else(|| SyncError::transfer(table, "column name is NULL"))
        })
        .collect()
}

/// Current change tracking version of a source table.
///
/// `global` reads the database-wide counter; otherwise the version is
/// scoped to the table's own change feed.
pub async fn source_version(
    pool: &MssqlPool,
    table: &str,
    global: bool,
    timeout: Duration,
) -> Result<TableVersion> {
    let per_table;
    let (sql, param) = if global {
        (GLOBAL_VERSION_SQL, Some(table))
    } else {
        per_table = table_version_sql(table);
        (per_table.as_str(), None)
    };

    let rows = with_timeout(
        &format!("reading change tracking version of {}", table),
        timeout,
        query_rows(pool, sql, param),
    )
    .await
    .map_err(|e| SyncError::version_query(table, e))?;

    let row = rows
        .first()
        .ok_or_else(|| SyncError::version_query(table, "version query returned no rows"))?;
    let read = |idx: usize| {
        row.try_get::<i64, _>(idx)
            .map_err(|e| SyncError::version_query(table, e))
    };
    let current = read(0)?;
    let min_valid = read(1)?;
    let queried = row
        .try_get::<DateTime<Utc>, _>(2)
        .map_err(|e| SyncError::version_query(table, e))?;

    match (current, min_valid) {
        (Some(current_version), Some(min_valid_version)) => Ok(TableVersion {
            table_name: table.to_string(),
            current_version,
            min_valid_version,
            queried,
        }),
        _ => Err(SyncError::version_query(
            table,
            format!("change tracking is not enabled on {} for this table", pool.label()),
        )),
    }
}

/// Approximate row count from partition metadata.
pub async fn row_count(pool: &MssqlPool, table: &str, timeout: Duration) -> Result<i64> {
    let rows = with_timeout(
        &format!("counting rows of {}", table),
        timeout,
        query_rows(pool, ROW_COUNT_SQL, Some(table)),
    )
    .await
    .map_err(|e| SyncError::schema_query(table, e))?;

    Ok(rows
        .first()
        .map(|row| row.try_get::<i64, _>(0))
        .transpose()
        .map_err(|e| SyncError::schema_query(table, e))?
        .flatten()
        .unwrap_or(0))
}

pub async fn db_info(pool: &MssqlPool, timeout: Duration) -> Result<DbInfo> {
    let rows = with_timeout("reading database info", timeout, query_rows(pool, DB_INFO_SQL, None)).await?;
    let row = rows
        .first()
        .ok_or_else(|| SyncError::schema_query(pool.label(), "database info query returned no rows"))?;
    let ctx = |e: tiberius::error::Error| SyncError::schema_query(pool.label(), e);

    Ok(DbInfo {
        server_name: get_string(row, 0).map_err(ctx)?,
        database_name: get_string(row, 1).map_err(ctx)?,
        is_change_tracking_database: row.try_get::<bool, _>(2).map_err(ctx)?.unwrap_or(false),
        is_auto_cleanup_on: row.try_get::<bool, _>(3).map_err(ctx)?.unwrap_or(false),
        retention_period: row.try_get::<i32, _>(4).map_err(ctx)?,
        retention_period_unit: get_string(row, 5).map_err(ctx)?,
        server_version: get_string(row, 6).map_err(ctx)?,
    })
}

pub async fn change_tracking_tables(
    pool: &MssqlPool,
    timeout: Duration,
) -> Result<Vec<SourceTableChangeTrackingInfo>> {
    let rows = with_timeout(
        "reading change tracking tables",
        timeout,
        query_rows(pool, CHANGE_TRACKING_TABLES_SQL, None),
    )
    .await?;
    let ctx = |e: tiberius::error::Error| SyncError::schema_query(pool.label(), e);

    rows.iter()
        .map(|row| {
            Ok(SourceTableChangeTrackingInfo {
                table_object_id: row.try_get::<i32, _>(0).map_err(ctx)?.unwrap_or_default(),
                schema_name: get_string(row, 1).map_err(ctx)?.unwrap_or_default(),
                table_name: get_string(row, 2).map_err(ctx)?.unwrap_or_default(),
                track_columns_updated: row.try_get::<bool, _>(3).map_err(ctx)?.unwrap_or(false),
                min_valid_version: row.try_get::<i64, _>(4).map_err(ctx)?.unwrap_or_default(),
                current_database_version: row.try_get::<i64, _>(5).map_err(ctx)?,
            })
        })
        .collect()
}
