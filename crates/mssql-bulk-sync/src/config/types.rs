//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Root configuration structure: every sync job keyed by job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJobsConfig {
    /// Engine-wide settings (timeouts, defaults).
    #[serde(default)]
    pub settings: SyncSettings,

    /// Job definitions keyed by job id.
    #[serde(default)]
    pub jobs: BTreeMap<String, SyncJobConfig>,
}

/// Engine-wide settings. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Batch size used when a job does not set one (default: 1000).
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,

    /// Minutes a dispatched job stays valid (default: 4).
    #[serde(default = "default_job_expiry_minutes")]
    pub job_expiry_minutes: i64,

    /// Timeout for catalog and version queries (default: 180).
    #[serde(default = "default_schema_query_timeout")]
    pub schema_query_timeout_secs: u64,

    /// Timeout for a bulk load pass (default: 1800).
    #[serde(default = "default_long_timeout")]
    pub bulk_timeout_secs: u64,

    /// Timeout for merge, delete, truncate and staging DDL (default: 1800).
    #[serde(default = "default_long_timeout")]
    pub apply_timeout_secs: u64,

    /// Timeout for opening a connection (default: 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Max tenants resolved concurrently by the token cache (default: 4).
    #[serde(default = "default_token_concurrency")]
    pub token_concurrency: usize,

    /// Cached tokens expiring within this margin are refreshed (default: 300).
    #[serde(default = "default_token_refresh_margin")]
    pub token_refresh_margin_secs: i64,

    /// Target schema holding staging tables and the version store (default: sync).
    #[serde(default = "default_sync_schema")]
    pub sync_schema: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            default_batch_size: default_batch_size(),
            job_expiry_minutes: default_job_expiry_minutes(),
            schema_query_timeout_secs: default_schema_query_timeout(),
            bulk_timeout_secs: default_long_timeout(),
            apply_timeout_secs: default_long_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            token_concurrency: default_token_concurrency(),
            token_refresh_margin_secs: default_token_refresh_margin(),
            sync_schema: default_sync_schema(),
        }
    }
}

impl SyncSettings {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            schema_query: Duration::from_secs(self.schema_query_timeout_secs),
            bulk: Duration::from_secs(self.bulk_timeout_secs),
            apply: Duration::from_secs(self.apply_timeout_secs),
        }
    }
}

/// Per-operation timeouts applied to every database call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub schema_query: Duration,
    pub bulk: Duration,
    pub apply: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        SyncSettings::default().timeouts()
    }
}

/// Source or target data source.
#[derive(Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// ADO.NET style connection string
    /// (e.g. `Server=tcp:host,1433;Database=db;User Id=u;Password=p`).
    pub connection_string: String,

    /// Authenticate with a managed identity access token instead of the
    /// credentials in the connection string.
    #[serde(default)]
    pub managed_identity: bool,

    /// Tenant the managed identity token is issued for.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl DataSourceConfig {
    /// Cache key for this source's token, or `None` when the source uses
    /// plain connection string auth. Tenant ids compare case-insensitively.
    pub fn token_key(&self) -> Option<String> {
        if !self.managed_identity {
            return None;
        }
        self.tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    /// `server/database` as named by the connection string, for log context.
    pub fn describe(&self) -> String {
        describe_connection_string(&self.connection_string)
    }
}

/// `server/database` named by an ADO.NET connection string. Never includes
/// credentials.
pub fn describe_connection_string(connection_string: &str) -> String {
    let mut server = "?";
    let mut database = "?";
    for part in connection_string.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim().to_lowercase().as_str() {
            "server" | "data source" | "address" | "addr" | "network address" => {
                server = value.trim()
            }
            "database" | "initial catalog" => database = value.trim(),
            _ => {}
        }
    }
    format!("{}/{}", server, database)
}

// Custom Debug implementation to redact credentials
impl fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("connection_string", &self.describe())
            .field("managed_identity", &self.managed_identity)
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// One sync job as authored by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJobConfig {
    /// Logical area the job is grouped under.
    #[serde(default)]
    pub area: Option<String>,

    pub source: DataSourceConfig,

    pub target: DataSourceConfig,

    /// Tables to sync: key -> source table name.
    pub tables: BTreeMap<String, String>,

    /// Target table overrides: key (from `tables`) -> target table name.
    #[serde(default)]
    pub target_tables: BTreeMap<String, String>,

    /// Tables whose identity values must not be inserted explicitly.
    #[serde(default)]
    pub disable_target_identity_insert_tables: BTreeMap<String, bool>,

    /// Rows per bulk batch (default: `settings.default_batch_size`).
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Manual jobs only run on demand, never on a schedule.
    #[serde(default)]
    pub manual: bool,

    /// Schedule flags: schedule name -> enabled.
    #[serde(default)]
    pub schedules: BTreeMap<String, bool>,

    /// Query the database-wide change tracking version rather than a
    /// per-table one (default: true).
    #[serde(default = "default_true")]
    pub global_change_tracking: bool,
}

impl SyncJobConfig {
    /// Data sources of this job.
    pub fn data_sources(&self) -> [&DataSourceConfig; 2] {
        [&self.source, &self.target]
    }

    /// Area comparison used by every lookup: case-insensitive.
    pub fn in_area(&self, area: &str) -> bool {
        self.area
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(area.trim()))
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_job_expiry_minutes() -> i64 {
    4
}

fn default_schema_query_timeout() -> u64 {
    180
}

fn default_long_timeout() -> u64 {
    1800
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_token_concurrency() -> usize {
    4
}

fn default_token_refresh_margin() -> i64 {
    300
}

fn default_sync_schema() -> String {
    "sync".to_string()
}

fn default_true() -> bool {
    true
}
