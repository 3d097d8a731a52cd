//! Per-table sync plans.
//!
//! A [`TableSchema`] is built once per table per run from freshly queried
//! columns and versions. It carries every statement the sync needs, rendered
//! up front by [`statements`], and is never mutated afterwards.

pub mod statements;

use crate::core::identifier::{qualify_mssql, sanitize_table_name};
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Version recorded for tables that were never synced.
pub const NEVER_SYNCED_VERSION: i64 = -1;

/// Batch size used when neither the job nor the settings name one.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Longest table-name prefix kept in a staging table name; leaves room for
/// the `_` + uuid suffix inside SQL Server's 128 character limit.
const MAX_STAGING_PREFIX: usize = 90;

/// Column metadata as read from the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Bracket-quoted name (`QUOTENAME` output).
    pub quoted_name: String,

    /// Declared type with length/precision folded in, e.g. `nvarchar(50)`.
    pub data_type: String,

    pub is_identity: bool,

    /// Member of the primary key.
    pub is_primary: bool,

    pub is_nullable: bool,

    pub collation: Option<String>,
}

impl Column {
    /// Staging table column definition.
    pub fn definition(&self) -> String {
        let mut def = format!("{} {}", self.quoted_name, self.data_type);
        if let Some(collation) = self.collation.as_deref().filter(|c| !c.is_empty()) {
            def.push_str(" COLLATE ");
            def.push_str(collation);
        }
        def.push_str(if self.is_nullable { " NULL" } else { " NOT NULL" });
        def
    }
}

/// Change tracking version of one table.
///
/// Field-wise equality: two versions are equal only if table name, both
/// version numbers and the query timestamp all match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableVersion {
    pub table_name: String,
    pub current_version: i64,
    pub min_valid_version: i64,
    pub queried: Option<DateTime<Utc>>,
}

impl TableVersion {
    /// Sentinel returned when the version store has no record for a table.
    pub fn never_synced(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            current_version: NEVER_SYNCED_VERSION,
            min_valid_version: NEVER_SYNCED_VERSION,
            queried: None,
        }
    }

    /// Same version numbers recorded under another table name.
    pub fn renamed(&self, table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (current {}, min valid {}",
            self.table_name, self.current_version, self.min_valid_version
        )?;
        if let Some(queried) = self.queried {
            write!(f, ", queried {}", queried.to_rfc3339())?;
        }
        write!(f, ")")
    }
}

/// Inputs for building a [`TableSchema`].
#[derive(Debug, Clone)]
pub struct TableSchemaInput {
    /// Catalog-resolved, bracket-quoted source table name.
    pub source_table_name: String,
    /// Catalog-resolved, bracket-quoted target table name.
    pub target_table_name: String,
    pub columns: Vec<Column>,
    pub source_version: TableVersion,
    pub target_version: TableVersion,
    pub batch_size: usize,
    pub disable_target_identity_insert: bool,
    /// Schema holding staging tables.
    pub sync_schema: String,
}

/// Statements for incremental (staged) sync. Needs a primary key.
#[derive(Debug, Clone)]
pub struct IncrementalStatements {
    pub create_new_or_updated: String,
    pub create_deleted: String,
    pub select_new_or_updated: String,
    pub select_deleted: String,
    pub merge: String,
    pub delete: String,
}

/// Every statement a table sync can run.
#[derive(Debug, Clone)]
pub struct SyncStatements {
    /// `None` when the table has no primary key.
    pub incremental: Option<IncrementalStatements>,
    pub drop_new_or_updated: String,
    pub drop_deleted: String,
    pub staging_exists: String,
    pub leftover_staging_count: String,
    pub truncate: String,
    pub select_all: String,
    /// Staging copy used to seed through `IDENTITY_INSERT`.
    pub create_seed_staging: String,
    pub insert_from_seed_staging: String,
}

/// Per-table sync plan.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub source_table_name: String,
    pub target_table_name: String,
    pub new_or_updated_table_name: String,
    pub deleted_table_name: String,
    pub columns: Vec<Column>,
    pub source_version: TableVersion,
    pub target_version: TableVersion,
    pub batch_size: usize,
    /// Explicit identity values are inserted into the target.
    pub identity_insert: bool,
    pub statements: SyncStatements,
}

impl TableSchema {
    /// Build the plan and render all statements.
    ///
    /// Fails if the column set is empty. A missing primary key is only an
    /// error once incremental statements are requested.
    pub fn new(input: TableSchemaInput) -> Result<Self> {
        if input.columns.is_empty() {
            return Err(SyncError::schema_query(
                &input.source_table_name,
                "no columns found (table missing or not visible)",
            ));
        }

        let prefix = staging_prefix(&input.target_table_name);
        let new_or_updated_table_name = staging_table_name(&input.sync_schema, &prefix)?;
        let deleted_table_name = staging_table_name(&input.sync_schema, &prefix)?;

        let identity_insert = !input.disable_target_identity_insert
            && input.columns.iter().any(|c| c.is_identity);

        let mut schema = Self {
            source_table_name: input.source_table_name,
            target_table_name: input.target_table_name,
            new_or_updated_table_name,
            deleted_table_name,
            columns: input.columns,
            source_version: input.source_version,
            target_version: input.target_version,
            batch_size: input.batch_size.max(1),
            identity_insert,
            statements: SyncStatements::placeholder(),
        };
        schema.statements = statements::render(&schema, &input.sync_schema, &prefix);
        Ok(schema)
    }

    pub fn primary_key(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_primary)
    }

    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.is_primary)
    }

    /// Source and target already agree; nothing to move.
    pub fn is_up_to_date(&self) -> bool {
        self.source_version.current_version == self.target_version.current_version
    }

    /// The target was never synced.
    pub fn never_synced(&self) -> bool {
        self.target_version.current_version <= 1
    }

    /// Incremental changes since the target version are no longer retained
    /// at the source.
    pub fn baseline_expired(&self) -> bool {
        !self.never_synced()
            && self.target_version.current_version < self.source_version.min_valid_version
    }

    /// Compare full snapshots instead of diffing change tracking.
    pub fn requires_full_reconcile(&self) -> bool {
        self.never_synced() || self.baseline_expired()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn primary_key_names(&self) -> Vec<String> {
        self.primary_key().map(|c| c.name.clone()).collect()
    }

    /// Incremental statements, or `NoPrimaryKey`.
    pub fn incremental(&self) -> Result<&IncrementalStatements> {
        self.statements
            .incremental
            .as_ref()
            .ok_or_else(|| SyncError::NoPrimaryKey(self.source_table_name.clone()))
    }
}

impl SyncStatements {
    fn placeholder() -> Self {
        Self {
            incremental: None,
            drop_new_or_updated: String::new(),
            drop_deleted: String::new(),
            staging_exists: String::new(),
            leftover_staging_count: String::new(),
            truncate: String::new(),
            select_all: String::new(),
            create_seed_staging: String::new(),
            insert_from_seed_staging: String::new(),
        }
    }
}

fn staging_prefix(target_table_name: &str) -> String {
    sanitize_table_name(target_table_name)
        .chars()
        .take(MAX_STAGING_PREFIX)
        .collect()
}

fn staging_table_name(sync_schema: &str, prefix: &str) -> Result<String> {
    qualify_mssql(sync_schema, &format!("{}_{}", prefix, Uuid::new_v4()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn column(name: &str, data_type: &str, primary: bool, identity: bool) -> Column {
        Column {
            name: name.to_string(),
            quoted_name: format!("[{}]", name),
            data_type: data_type.to_string(),
            is_identity: identity,
            is_primary: primary,
            is_nullable: !primary,
            collation: None,
        }
    }

    pub(crate) fn version(table: &str, current: i64, min_valid: i64) -> TableVersion {
        TableVersion {
            table_name: table.to_string(),
            current_version: current,
            min_valid_version: min_valid,
            queried: None,
        }
    }

    pub(crate) fn input(target_current: i64) -> TableSchemaInput {
        TableSchemaInput {
            source_table_name: "[dbo].[Orders]".into(),
            target_table_name: "[dbo].[Orders]".into(),
            columns: vec![
                column("Id", "int", true, true),
                Column {
                    collation: Some("Latin1_General_CI_AS".into()),
                    ..column("Name", "nvarchar(50)", false, false)
                },
                column("Total", "decimal(18, 2)", false, false),
            ],
            source_version: version("[dbo].[Orders]", 120, 40),
            target_version: version("[dbo].[Orders]", target_current, 40),
            batch_size: 1000,
            disable_target_identity_insert: false,
            sync_schema: "sync".into(),
        }
    }

    #[test]
    fn test_column_definition() {
        let col = Column {
            collation: Some("Latin1_General_CI_AS".into()),
            ..column("Name", "nvarchar(50)", false, false)
        };
        assert_eq!(
            col.definition(),
            "[Name] nvarchar(50) COLLATE Latin1_General_CI_AS NULL"
        );
        assert_eq!(column("Id", "int", true, true).definition(), "[Id] int NOT NULL");
    }

    #[test]
    fn test_never_synced_sentinel_is_below_first_version() {
        let v = TableVersion::never_synced("[dbo].[Orders]");
        assert_eq!(v.current_version, -1);
        assert_eq!(v.min_valid_version, -1);
        assert!(v.current_version < 1);
    }

    #[test]
    fn test_version_equality_is_field_wise() {
        let a = version("[dbo].[Orders]", 10, 2);
        assert_eq!(a, a.clone());
        assert_ne!(a, a.renamed("[dbo].[Other]"));
        assert_ne!(a, version("[dbo].[Orders]", 10, 3));
    }

    #[test]
    fn test_staging_names_are_namespaced_and_distinct() {
        let schema = TableSchema::new(input(100)).unwrap();
        assert!(schema.new_or_updated_table_name.starts_with("[sync].[dbo.Orders_"));
        assert!(schema.deleted_table_name.starts_with("[sync].[dbo.Orders_"));
        assert_ne!(schema.new_or_updated_table_name, schema.deleted_table_name);
    }

    #[test]
    fn test_staging_name_fits_identifier_limit() {
        let mut long = input(100);
        long.target_table_name = format!("[dbo].[{}]", "x".repeat(120));
        let schema = TableSchema::new(long).unwrap();
        let table_part = schema
            .new_or_updated_table_name
            .trim_start_matches("[sync].[")
            .trim_end_matches(']');
        assert!(table_part.chars().count() <= 128);
    }

    #[test]
    fn test_up_to_date_and_reconcile_decisions() {
        let mut same = input(120);
        same.target_version = version("[dbo].[Orders]", 120, 40);
        assert!(TableSchema::new(same).unwrap().is_up_to_date());

        let never = TableSchema::new(input(-1)).unwrap();
        assert!(never.never_synced());
        assert!(never.requires_full_reconcile());

        let expired = TableSchema::new(input(10)).unwrap();
        assert!(expired.baseline_expired());
        assert!(expired.requires_full_reconcile());

        let incremental = TableSchema::new(input(100)).unwrap();
        assert!(!incremental.requires_full_reconcile());
    }

    #[test]
    fn test_idle_table_past_cleanup_is_reconciled() {
        // Last change at 100, cleanup moved min valid to 150 and nothing
        // changed since: the version query falls back to min valid.
        let mut idle = input(100);
        idle.source_version = version("[dbo].[Orders]", 150, 150);
        let schema = TableSchema::new(idle).unwrap();

        assert!(!schema.is_up_to_date());
        assert!(schema.baseline_expired());
        assert!(schema.requires_full_reconcile());
    }

    #[test]
    fn test_identity_insert_flag() {
        assert!(TableSchema::new(input(100)).unwrap().identity_insert);

        let mut disabled = input(100);
        disabled.disable_target_identity_insert = true;
        assert!(!TableSchema::new(disabled).unwrap().identity_insert);
    }

    #[test]
    fn test_missing_columns_is_schema_error() {
        let mut empty = input(100);
        empty.columns.clear();
        assert!(matches!(
            TableSchema::new(empty),
            Err(SyncError::SchemaQuery { .. })
        ));
    }

    #[test]
    fn test_no_primary_key_blocks_incremental_only() {
        let mut no_pk = input(100);
        for c in &mut no_pk.columns {
            c.is_primary = false;
        }
        let schema = TableSchema::new(no_pk).unwrap();
        assert!(matches!(schema.incremental(), Err(SyncError::NoPrimaryKey(_))));
        assert!(schema.statements.select_all.starts_with("SELECT"));
    }
}
