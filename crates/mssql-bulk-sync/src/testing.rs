//! In-memory source and target databases for exercising the sync workflow
//! without a SQL Server.
//!
//! The fakes recognize the statements rendered by [`crate::schema`] by
//! shape only: rows are keyed by their first column and staging tables are
//! plain row lists.

use crate::core::pool::InFlight;
use crate::error::{Result, SyncError};
use crate::job::SyncJob;
use crate::orchestrator::Connector;
use crate::schema::{Column, TableVersion};
use crate::source::{RowChunk, SourceDatabase, SqlRow};
use crate::state::VersionStore;
use crate::target::TargetDatabase;
use async_trait::async_trait;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiberius::ColumnData;
use tokio::sync::mpsc;

/// `dbo.Orders`, `Orders` and `[dbo].[Orders]` all become `[dbo].[Orders]`.
pub(crate) fn canonical(name: &str) -> String {
    let parts: Vec<&str> = name
        .split('.')
        .map(|p| p.trim().trim_start_matches('[').trim_end_matches(']'))
        .collect();
    match parts.as_slice() {
        [table] => format!("[dbo].[{}]", table),
        [schema, table] => format!("[{}].[{}]", schema, table),
        _ => name.to_string(),
    }
}

pub(crate) fn row(id: i32, name: &str) -> SqlRow {
    vec![
        ColumnData::I32(Some(id)),
        ColumnData::String(Some(Cow::Owned(name.to_string()))),
    ]
}

pub(crate) fn key(id: i32) -> SqlRow {
    vec![ColumnData::I32(Some(id))]
}

/// `Id int` identity primary key plus `Name nvarchar(50)`.
pub(crate) fn columns() -> Vec<Column> {
    use crate::schema::tests::column;
    vec![
        column("Id", "int", true, true),
        column("Name", "nvarchar(50)", false, false),
    ]
}

fn id_of(row: &SqlRow) -> Option<i32> {
    match row.first() {
        Some(ColumnData::I32(id)) => *id,
        _ => None,
    }
}

fn name_of(row: &SqlRow) -> Option<String> {
    match row.get(1) {
        Some(ColumnData::String(Some(name))) => Some(name.to_string()),
        _ => None,
    }
}

/// `dbo.Orders` -> `dbo.Orders_`, the start of its staging table names.
fn staging_prefix(table: &str) -> String {
    let flat: String = canonical(table).chars().filter(|c| *c != '[' && *c != ']').collect();
    format!("{}_", flat)
}

/// Identifier following `marker`, up to whitespace, `;` or `(`.
fn name_after<'a>(sql: &'a str, marker: &str) -> Option<&'a str> {
    let start = sql.find(marker)? + marker.len();
    let rest = &sql[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || c == ';' || c == '(')
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// One source table.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeTable {
    pub columns: Vec<Column>,
    /// `None` means change tracking is not enabled.
    pub version: Option<TableVersion>,
    /// Current contents.
    pub rows: Vec<SqlRow>,
    /// Rows returned by the change feed for inserts and updates.
    pub changed: Vec<SqlRow>,
    /// Keys returned by the change feed for deletes.
    pub deleted: Vec<SqlRow>,
}

impl FakeTable {
    pub(crate) fn new(version: i64, rows: Vec<SqlRow>) -> Self {
        let mut table = Self {
            columns: columns(),
            rows,
            ..Default::default()
        };
        table.version = Some(TableVersion {
            table_name: String::new(),
            current_version: version,
            min_valid_version: 40,
            queried: None,
        });
        table
    }

    pub(crate) fn with_changes(mut self, changed: Vec<SqlRow>, deleted: Vec<SqlRow>) -> Self {
        self.changed = changed;
        self.deleted = deleted;
        self
    }
}

/// Source database backed by scripted result sets.
#[derive(Default)]
pub(crate) struct FakeSource {
    scripted: HashMap<String, Vec<SqlRow>>,
    tables: HashMap<String, FakeTable>,
    queries: Mutex<Vec<String>>,
}

impl FakeSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Answer exactly `sql` with `n` generated rows.
    pub(crate) fn with_rows(mut self, sql: &str, n: usize) -> Self {
        let rows = (0..n).map(|i| row(i as i32 + 1, &format!("row {}", i + 1))).collect();
        self.scripted.insert(sql.to_string(), rows);
        self
    }

    pub(crate) fn with_table(mut self, name: &str, mut table: FakeTable) -> Self {
        let name = canonical(name);
        if let Some(version) = table.version.as_mut() {
            version.table_name = name.clone();
        }
        self.tables.insert(name, table);
        self
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    fn table(&self, name: &str) -> Result<&FakeTable> {
        self.tables
            .get(name)
            .ok_or_else(|| SyncError::schema_query(name, "table not found"))
    }

    fn rows_for(&self, sql: &str) -> Vec<SqlRow> {
        if let Some(rows) = self.scripted.get(sql) {
            return rows.clone();
        }
        let Some(table) = self
            .tables
            .iter()
            .find(|(name, _)| sql.contains(name.as_str()))
            .map(|(_, table)| table)
        else {
            return Vec::new();
        };
        if sql.contains("SYS_CHANGE_OPERATION = 'D'") {
            table.deleted.clone()
        } else if sql.contains("CHANGETABLE") {
            table.changed.clone()
        } else if sql.contains("TOP 0") {
            Vec::new()
        } else {
            table.rows.clone()
        }
    }
}

#[async_trait]
impl SourceDatabase for FakeSource {
    async fn resolve_table(&self, table: &str) -> Result<String> {
        let name = canonical(table);
        self.table(&name)?;
        Ok(name)
    }

    async fn columns(&self, table: &str) -> Result<Vec<Column>> {
        Ok(self.table(table)?.columns.clone())
    }

    async fn change_tracking_version(&self, table: &str, _global: bool) -> Result<TableVersion> {
        self.table(table)?
            .version
            .clone()
            .ok_or_else(|| SyncError::version_query(table, "change tracking is not enabled"))
    }

    async fn read_chunks(&self, sql: &str, chunk_size: usize, tx: mpsc::Sender<RowChunk>) -> Result<u64> {
        self.queries.lock().unwrap().push(sql.to_string());
        let rows = self.rows_for(sql);
        let total = rows.len() as u64;
        for chunk in rows.chunks(chunk_size.max(1)) {
            tx.send(RowChunk {
                rows: chunk.to_vec(),
                read_time: Duration::ZERO,
            })
            .await
            .map_err(|_| SyncError::transfer("fake source", "row consumer stopped"))?;
        }
        Ok(total)
    }

    fn label(&self) -> &str {
        "fake source"
    }
}

#[derive(Default)]
struct TargetState {
    tables: HashMap<String, Vec<SqlRow>>,
    batches: HashMap<String, Vec<usize>>,
    versions: HashMap<String, TableVersion>,
    statements: Vec<String>,
    init_calls: usize,
    reconnects: usize,
}

/// Target database holding tables as row lists.
#[derive(Default)]
pub(crate) struct FakeTarget {
    state: Mutex<TargetState>,
    failing_bulk_loads: HashSet<String>,
    failing_statements: Vec<String>,
    conflicting_staging: Vec<String>,
    stalled_bulk_loads: Vec<String>,
    /// Same contract as the live pool: set when an exchange is abandoned,
    /// cleared by the next checkout, which reconnects.
    broken: AtomicBool,
}

impl FakeTarget {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_table(self, name: &str, rows: Vec<SqlRow>) -> Self {
        self.state.lock().unwrap().tables.insert(canonical(name), rows);
        self
    }

    pub(crate) fn with_version(self, name: &str, current: i64) -> Self {
        let name = canonical(name);
        self.state.lock().unwrap().versions.insert(
            name.clone(),
            TableVersion {
                table_name: name,
                current_version: current,
                min_valid_version: 40,
                queried: None,
            },
        );
        self
    }

    /// Bulk loads into `destination` fail.
    pub(crate) fn fail_bulk_load(mut self, destination: &str) -> Self {
        self.failing_bulk_loads.insert(destination.to_string());
        self
    }

    /// Statements containing `fragment` fail.
    pub(crate) fn fail_on(mut self, fragment: &str) -> Self {
        self.failing_statements.push(fragment.to_string());
        self
    }

    /// Report staging tables of `table` as already present.
    pub(crate) fn with_staging_conflict(mut self, table: &str) -> Self {
        self.conflicting_staging.push(staging_prefix(table));
        self
    }

    /// Bulk loads into staging tables of `table` never complete.
    pub(crate) fn stall_bulk_load(mut self, table: &str) -> Self {
        self.stalled_bulk_loads.push(staging_prefix(table));
        self
    }

    /// Connections thrown away after an abandoned exchange.
    pub(crate) fn reconnects(&self) -> usize {
        self.state.lock().unwrap().reconnects
    }

    fn checkout(&self) {
        if self.broken.swap(false, Ordering::AcqRel) {
            self.state.lock().unwrap().reconnects += 1;
        }
    }

    pub(crate) fn loaded_batches(&self, destination: &str) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .batches
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// `(id, name)` pairs of a table, ordered by id.
    pub(crate) fn contents(&self, table: &str) -> Vec<(i32, String)> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<(i32, String)> = state
            .tables
            .get(&canonical(table))
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| Some((id_of(r)?, name_of(r).unwrap_or_default())))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort();
        rows
    }

    /// Tables currently present in `schema`.
    pub(crate) fn tables_in(&self, schema: &str) -> Vec<String> {
        let prefix = format!("[{}].", schema);
        self.state
            .lock()
            .unwrap()
            .tables
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub(crate) fn version(&self, table: &str) -> Option<TableVersion> {
        self.state.lock().unwrap().versions.get(&canonical(table)).cloned()
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub(crate) fn init_calls(&self) -> usize {
        self.state.lock().unwrap().init_calls
    }

    fn record(&self, sql: &str) -> Result<()> {
        self.checkout();
        self.state.lock().unwrap().statements.push(sql.to_string());
        match self.failing_statements.iter().find(|f| sql.contains(f.as_str())) {
            Some(fragment) => Err(SyncError::apply(
                "fake target",
                format!("injected failure on {}", fragment),
            )),
            None => Ok(()),
        }
    }

    fn missing(sql: &str) -> SyncError {
        SyncError::apply("fake target", format!("unrecognized statement: {}", sql))
    }

    fn merge(&self, sql: &str) -> Result<i64> {
        let target = name_after(sql, "MERGE ").ok_or_else(|| Self::missing(sql))?;
        let staging = name_after(sql, "USING ").ok_or_else(|| Self::missing(sql))?;
        let mut state = self.state.lock().unwrap();
        let staged = state.tables.get(staging).cloned().unwrap_or_default();
        let rows = state.tables.entry(target.to_string()).or_default();

        let mut affected = 0;
        if sql.contains("WHEN NOT MATCHED BY SOURCE") {
            let before = rows.len();
            rows.retain(|r| staged.iter().any(|s| id_of(s) == id_of(r)));
            affected += before - rows.len();
        }
        for staged_row in staged {
            match rows.iter_mut().find(|r| id_of(r) == id_of(&staged_row)) {
                Some(existing) => *existing = staged_row,
                None => rows.push(staged_row),
            }
            affected += 1;
        }
        Ok(affected as i64)
    }

    fn delete(&self, sql: &str) -> Result<i64> {
        let target = name_after(sql, "FROM ").ok_or_else(|| Self::missing(sql))?;
        let staging = name_after(sql, "INNER JOIN ").ok_or_else(|| Self::missing(sql))?;
        let mut state = self.state.lock().unwrap();
        let keys: Vec<Option<i32>> = state
            .tables
            .get(staging)
            .map(|rows| rows.iter().map(id_of).collect())
            .unwrap_or_default();
        let rows = state.tables.entry(target.to_string()).or_default();
        let before = rows.len();
        rows.retain(|r| !keys.contains(&id_of(r)));
        Ok((before - rows.len()) as i64)
    }

    fn insert_select(&self, sql: &str) -> Result<i64> {
        let target = name_after(sql, "INSERT INTO ").ok_or_else(|| Self::missing(sql))?;
        let from = sql.rfind("FROM ").ok_or_else(|| Self::missing(sql))?;
        let staging = name_after(&sql[from..], "FROM ").ok_or_else(|| Self::missing(sql))?;
        let mut state = self.state.lock().unwrap();
        let staged = state.tables.get(staging).cloned().unwrap_or_default();
        let count = staged.len();
        state.tables.entry(target.to_string()).or_default().extend(staged);
        Ok(count as i64)
    }
}

#[async_trait]
impl VersionStore for FakeTarget {
    async fn init_schema(&self) -> Result<()> {
        self.state.lock().unwrap().init_calls += 1;
        Ok(())
    }

    async fn load_version(&self, table: &str) -> Result<TableVersion> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .versions
            .get(table)
            .cloned()
            .unwrap_or_else(|| TableVersion::never_synced(table)))
    }

    async fn save_version(&self, version: &TableVersion) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .versions
            .insert(version.table_name.clone(), version.clone());
        Ok(())
    }
}

#[async_trait]
impl TargetDatabase for FakeTarget {
    async fn resolve_table(&self, table: &str) -> Result<String> {
        self.checkout();
        let name = canonical(table);
        if self.state.lock().unwrap().tables.contains_key(&name) {
            Ok(name)
        } else {
            Err(SyncError::schema_query(table, "table not found"))
        }
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.record(sql)?;
        let mut state = self.state.lock().unwrap();
        if let Some(table) = name_after(sql, "TRUNCATE TABLE ") {
            state.tables.entry(table.to_string()).or_default().clear();
        } else if let Some(table) = name_after(sql, "CREATE TABLE ") {
            state.tables.insert(table.to_string(), Vec::new());
        } else if let Some(table) = name_after(sql, "DROP TABLE ") {
            state.tables.remove(table);
        }
        Ok(())
    }

    async fn query_scalar(&self, sql: &str) -> Result<i64> {
        self.record(sql)?;
        if sql.contains("LeftoverCount") {
            Ok(0)
        } else if sql.contains("MERGE ") {
            self.merge(sql)
        } else if sql.starts_with("DELETE target") {
            self.delete(sql)
        } else if sql.contains("INSERT INTO ") {
            self.insert_select(sql)
        } else {
            Err(Self::missing(sql))
        }
    }

    async fn query_flag(&self, sql: &str) -> Result<bool> {
        self.record(sql)?;
        Ok(sql.contains("SyncTableExists")
            && self.conflicting_staging.iter().any(|prefix| sql.contains(prefix.as_str())))
    }

    async fn bulk_load(&self, destination: &str, _columns: &[String], rows: Vec<SqlRow>) -> Result<u64> {
        self.checkout();
        if self.failing_bulk_loads.contains(destination) {
            return Err(SyncError::transfer(destination, "injected bulk load failure"));
        }
        let mut in_flight = InFlight::new(&self.broken);
        if self.stalled_bulk_loads.iter().any(|prefix| destination.contains(prefix.as_str())) {
            std::future::pending::<()>().await;
        }
        let count = rows.len();
        {
            let mut state = self.state.lock().unwrap();
            state.batches.entry(destination.to_string()).or_default().push(count);
            state.tables.entry(destination.to_string()).or_default().extend(rows);
        }
        in_flight.complete();
        Ok(count as u64)
    }

    fn label(&self) -> &str {
        "fake target"
    }
}

/// Hands out shared fakes and counts connection attempts.
pub(crate) struct FakeConnector {
    pub source: Arc<FakeSource>,
    pub target: Arc<FakeTarget>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new(source: FakeSource, target: FakeTarget) -> Self {
        Self {
            source: Arc::new(source),
            target: Arc::new(target),
            connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Source = FakeSource;
    type Target = FakeTarget;

    async fn connect_source(&self, _job: &SyncJob) -> Result<Arc<FakeSource>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.source.clone())
    }

    async fn connect_target(&self, _job: &SyncJob) -> Result<Arc<FakeTarget>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.target.clone())
    }
}
