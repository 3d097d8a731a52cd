//! Version store trait.
//!
//! The [`VersionStore`] records, per target table, the source change
//! tracking version the table was last synced to. It is the only state shared
//! between runs: a table whose stored version equals the source's current
//! version is skipped, and a version is only written after the table's data
//! was applied.

use async_trait::async_trait;

use crate::error::Result;
use crate::schema::TableVersion;

/// Trait for version persistence backends.
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Provision the store. Idempotent check-then-create, safe to run on
    /// every job.
    async fn init_schema(&self) -> Result<()>;

    /// Last persisted version for a table, or
    /// [`TableVersion::never_synced`] when there is no record.
    async fn load_version(&self, table: &str) -> Result<TableVersion>;

    /// Upsert a version keyed by its table name, then verify what the store
    /// actually holds. A mismatch is a [`Persist`](crate::SyncError::Persist)
    /// error.
    async fn save_version(&self, version: &TableVersion) -> Result<()>;
}

/// Compare a written version against what the store echoed back.
///
/// The timestamp only takes part when one was written.
pub(crate) fn same_version(written: &TableVersion, stored: &TableVersion) -> bool {
    written.table_name == stored.table_name
        && written.current_version == stored.current_version
        && written.min_valid_version == stored.min_valid_version
        && (written.queried.is_none() || written.queried == stored.queried)
}
