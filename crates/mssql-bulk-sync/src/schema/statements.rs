//! T-SQL generation for table syncs.
//!
//! Pure functions of a [`TableSchema`]: no I/O, and identical inputs render
//! identical text apart from the staging table names embedded in the plan.
//! Identifiers come from the catalog already quoted; version numbers come
//! from the database as `i64` and are rendered as integer literals.

use super::{IncrementalStatements, SyncStatements, TableSchema};
use crate::core::identifier::string_literal;

const COLUMN_SEPARATOR: &str = ",\n        ";
const KEY_SEPARATOR: &str = " AND\n        ";

/// Render every statement for a plan.
pub(super) fn render(schema: &TableSchema, sync_schema: &str, staging_prefix: &str) -> SyncStatements {
    let incremental = schema.has_primary_key().then(|| IncrementalStatements {
        create_new_or_updated: create_new_or_updated_table(schema),
        create_deleted: create_deleted_table(schema),
        select_new_or_updated: select_new_or_updated(schema),
        select_deleted: select_deleted(schema),
        merge: merge_new_or_updated(schema),
        delete: delete_matched(schema),
    });

    SyncStatements {
        incremental,
        drop_new_or_updated: drop_table(&schema.new_or_updated_table_name),
        drop_deleted: drop_table(&schema.deleted_table_name),
        staging_exists: staging_exists(schema),
        leftover_staging_count: leftover_staging_count(sync_schema, staging_prefix),
        truncate: truncate_target(schema),
        select_all: select_all(schema),
        create_seed_staging: create_new_or_updated_table(schema),
        insert_from_seed_staging: insert_from_seed_staging(schema),
    }
}

fn quoted<'a>(columns: impl Iterator<Item = &'a super::Column>, prefix: &str) -> Vec<String> {
    columns
        .map(|c| format!("{}{}", prefix, c.quoted_name))
        .collect()
}

fn key_join(schema: &TableSchema, left: &str, right: &str) -> String {
    schema
        .primary_key()
        .map(|c| format!("{}.{} = {}.{}", left, c.quoted_name, right, c.quoted_name))
        .collect::<Vec<_>>()
        .join(KEY_SEPARATOR)
}

/// `ORDER BY` over identity key columns, empty when there are none.
fn identity_key_order(schema: &TableSchema, prefix: &str) -> String {
    let keys: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| c.is_primary && c.is_identity)
        .map(|c| format!("{}{} ASC", prefix, c.quoted_name))
        .collect();
    if keys.is_empty() {
        String::new()
    } else {
        format!("\n    ORDER BY {}", keys.join(", "))
    }
}

/// Wrap a row-counting body in `IDENTITY_INSERT` when the plan needs it.
/// The toggle is switched off again on the error path before rethrowing.
fn with_identity_insert(schema: &TableSchema, body: &str) -> String {
    if !schema.identity_insert {
        return format!(
            "DECLARE @RowCount bigint;\n{}\nSET @RowCount = ROWCOUNT_BIG();\nSELECT @RowCount AS [RowCount];",
            body
        );
    }
    let target = &schema.target_table_name;
    format!(
        "DECLARE @RowCount bigint;
SET IDENTITY_INSERT {target} ON;
BEGIN TRY
{body}
SET @RowCount = ROWCOUNT_BIG();
END TRY
BEGIN CATCH
SET IDENTITY_INSERT {target} OFF;
THROW;
END CATCH;
SET IDENTITY_INSERT {target} OFF;
SELECT @RowCount AS [RowCount];"
    )
}

/// Staging table holding new or updated rows: every column, keyed like the
/// source. Also used as the seed staging copy.
pub fn create_new_or_updated_table(schema: &TableSchema) -> String {
    create_staging_table(
        &schema.new_or_updated_table_name,
        schema.columns.iter().map(|c| c.definition()).collect(),
        quoted(schema.primary_key(), ""),
    )
}

/// Staging table holding deleted keys: key columns only.
pub fn create_deleted_table(schema: &TableSchema) -> String {
    create_staging_table(
        &schema.deleted_table_name,
        schema.primary_key().map(|c| c.definition()).collect(),
        quoted(schema.primary_key(), ""),
    )
}

fn create_staging_table(name: &str, definitions: Vec<String>, keys: Vec<String>) -> String {
    let mut body = definitions;
    if !keys.is_empty() {
        body.push(format!(
            "CONSTRAINT [PK_{}] PRIMARY KEY CLUSTERED ({})",
            uuid::Uuid::new_v4().simple(),
            keys.join(", ")
        ));
    }
    format!("CREATE TABLE {} (\n    {}\n)", name, body.join(",\n    "))
}

pub fn drop_table(name: &str) -> String {
    format!(
        "IF OBJECT_ID({}, N'U') IS NOT NULL\n    DROP TABLE {}",
        string_literal(name),
        name
    )
}

/// Reports whether either staging table of this plan already exists.
pub fn staging_exists(schema: &TableSchema) -> String {
    format!(
        "SELECT CAST(CASE
            WHEN OBJECT_ID({}, N'U') IS NOT NULL THEN 1
            WHEN OBJECT_ID({}, N'U') IS NOT NULL THEN 1
            ELSE 0
        END AS bit) AS SyncTableExists",
        string_literal(&schema.deleted_table_name),
        string_literal(&schema.new_or_updated_table_name)
    )
}

/// Counts staging tables left behind by earlier runs for the same target.
pub fn leftover_staging_count(sync_schema: &str, staging_prefix: &str) -> String {
    let pattern = format!("{}\\_%", escape_like(staging_prefix));
    format!(
        "SELECT CAST(COUNT(*) AS bigint) AS LeftoverCount
    FROM sys.tables t
        INNER JOIN sys.schemas s ON s.schema_id = t.schema_id
    WHERE s.name = {}
      AND t.name LIKE {} ESCAPE '\\'",
        string_literal(sync_schema),
        string_literal(&pattern)
    )
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Full-load select: every column, ordered by identity key when present.
pub fn select_all(schema: &TableSchema) -> String {
    format!(
        "SELECT  {}\n    FROM {} WITH (NOLOCK){}",
        quoted(schema.columns.iter(), "").join(COLUMN_SEPARATOR),
        schema.source_table_name,
        identity_key_order(schema, "")
    )
}

/// Rows inserted or updated at the source since the target version, with
/// current values joined back from the live table. Full select when the
/// target needs a full reconcile.
pub fn select_new_or_updated(schema: &TableSchema) -> String {
    if schema.requires_full_reconcile() {
        return select_all(schema);
    }
    format!(
        "SELECT  {}
    FROM CHANGETABLE(CHANGES {}, {}) ct
        INNER JOIN {} t WITH (NOLOCK) ON {}",
        quoted(schema.columns.iter(), "t.").join(COLUMN_SEPARATOR),
        schema.source_table_name,
        schema.target_version.current_version,
        schema.source_table_name,
        key_join(schema, "t", "ct")
    )
}

/// Keys deleted at the source since the target version. Empty by
/// construction (`TOP 0`) when the target needs a full reconcile.
pub fn select_deleted(schema: &TableSchema) -> String {
    if schema.requires_full_reconcile() {
        return format!(
            "SELECT  TOP 0 {}\n    FROM {} WITH (NOLOCK)",
            quoted(schema.primary_key(), "").join(COLUMN_SEPARATOR),
            schema.source_table_name
        );
    }
    format!(
        "SELECT  {}
    FROM CHANGETABLE(CHANGES {}, {}) ct
    WHERE ct.SYS_CHANGE_OPERATION = 'D'",
        quoted(schema.primary_key(), "ct.").join(COLUMN_SEPARATOR),
        schema.source_table_name,
        schema.target_version.current_version
    )
}

/// Upsert staged rows into the target on the full primary key.
///
/// On a full reconcile target rows missing from the staged snapshot are
/// deleted too. Identity columns are never updated, and only inserted
/// explicitly under `IDENTITY_INSERT`.
pub fn merge_new_or_updated(schema: &TableSchema) -> String {
    let insert_columns: Vec<&super::Column> = schema
        .columns
        .iter()
        .filter(|c| schema.identity_insert || !c.is_identity)
        .collect();
    let updates: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| !c.is_primary && !c.is_identity)
        .map(|c| format!("{} = source.{}", c.quoted_name, c.quoted_name))
        .collect();

    let mut merge = format!(
        "MERGE {} AS target
USING {} AS source
ON {}
WHEN NOT MATCHED BY TARGET
    THEN INSERT (
        {}
    ) VALUES (
        {}
    )",
        schema.target_table_name,
        schema.new_or_updated_table_name,
        key_join(schema, "target", "source"),
        quoted(insert_columns.iter().copied(), "").join(COLUMN_SEPARATOR),
        quoted(insert_columns.iter().copied(), "source.").join(COLUMN_SEPARATOR),
    );
    if schema.requires_full_reconcile() {
        merge.push_str("\nWHEN NOT MATCHED BY SOURCE\n    THEN DELETE");
    }
    if !updates.is_empty() {
        merge.push_str("\nWHEN MATCHED\n    THEN UPDATE\n        SET ");
        merge.push_str(&updates.join(",\n            "));
    }
    merge.push(';');

    with_identity_insert(schema, &merge)
}

/// Delete target rows whose key was staged as deleted.
pub fn delete_matched(schema: &TableSchema) -> String {
    format!(
        "DELETE target
    FROM {} AS target
        INNER JOIN {} AS source ON {};
SELECT CAST(ROWCOUNT_BIG() AS bigint) AS [RowCount];",
        schema.target_table_name,
        schema.deleted_table_name,
        key_join(schema, "target", "source")
    )
}

pub fn truncate_target(schema: &TableSchema) -> String {
    format!("TRUNCATE TABLE {}", schema.target_table_name)
}

/// Copy the seed staging table into the target, keeping identity values.
pub fn insert_from_seed_staging(schema: &TableSchema) -> String {
    let columns = quoted(schema.columns.iter(), "").join(COLUMN_SEPARATOR);
    let insert = format!(
        "INSERT INTO {} (
        {}
    )
SELECT  {}
    FROM {}{};",
        schema.target_table_name,
        columns,
        columns,
        schema.new_or_updated_table_name,
        identity_key_order(schema, "")
    );
    with_identity_insert(schema, &insert)
}
