//! Resolved, dispatchable sync jobs.
//!
//! A [`SyncJob`] is what travels from a trigger (schedule or on-demand
//! enqueue) to a worker: tables resolved, tokens attached, and an absolute
//! expiry after which the worker must drop it untouched.

use crate::config::{describe_connection_string, DataSourceConfig, SyncJobConfig};
use crate::error::{Result, SyncError};
use crate::schema::DEFAULT_BATCH_SIZE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One table of a job: where to read, where to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobTable {
    pub source: String,
    pub target: String,
    /// Never insert explicit identity values into the target.
    #[serde(default)]
    pub disable_target_identity_insert: bool,
}

/// A job ready to run.
#[derive(Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub area: Option<String>,
    /// Schedule that produced the job (`manual` for on-demand runs).
    pub schedule: String,
    pub source_connection: String,
    pub source_access_token: Option<String>,
    pub target_connection: String,
    pub target_access_token: Option<String>,
    pub tables: Vec<SyncJobTable>,
    pub batch_size: Option<usize>,
    pub expires: DateTime<Utc>,
    /// Truncate and fully reload every table.
    pub seed: bool,
    /// Read source versions from the database-wide counter.
    pub global_change_tracking: bool,
}

impl SyncJob {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires < now
    }

    /// `Expired` when the job's expiry has passed.
    pub fn ensure_not_expired(&self) -> Result<()> {
        if self.is_expired_at(Utc::now()) {
            return Err(SyncError::Expired {
                job: self.id.clone(),
                expires: self.expires,
            });
        }
        Ok(())
    }

    /// Job batch size, else `default`, never below one.
    pub fn effective_batch_size(&self, default: usize) -> usize {
        self.batch_size
            .filter(|b| *b > 0)
            .unwrap_or(if default > 0 { default } else { DEFAULT_BATCH_SIZE })
    }

    pub fn source_label(&self) -> String {
        describe_connection_string(&self.source_connection)
    }

    pub fn target_label(&self) -> String {
        describe_connection_string(&self.target_connection)
    }
}

impl fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |token: &Option<String>| token.as_ref().map(|_| "<redacted>");
        f.debug_struct("SyncJob")
            .field("id", &self.id)
            .field("area", &self.area)
            .field("schedule", &self.schedule)
            .field("source", &self.source_label())
            .field("source_access_token", &redact(&self.source_access_token))
            .field("target", &self.target_label())
            .field("target_access_token", &redact(&self.target_access_token))
            .field("tables", &self.tables)
            .field("batch_size", &self.batch_size)
            .field("expires", &self.expires)
            .field("seed", &self.seed)
            .field("global_change_tracking", &self.global_change_tracking)
            .finish()
    }
}

fn token_for(source: &DataSourceConfig, tokens: &HashMap<String, String>) -> Result<Option<String>> {
    match source.token_key() {
        None => Ok(None),
        Some(key) => tokens.get(&key).cloned().map(Some).ok_or_else(|| SyncError::Token {
            tenant: key,
            message: format!("no access token acquired for {}", source.describe()),
        }),
    }
}

impl SyncJobConfig {
    /// Resolve this configuration into a dispatchable job.
    ///
    /// `tokens` maps lowercased tenant ids to access tokens; a managed
    /// identity data source without a token is an error.
    pub fn to_sync_job(
        &self,
        id: &str,
        schedule: &str,
        tokens: &HashMap<String, String>,
        expires: DateTime<Utc>,
        seed: bool,
    ) -> Result<SyncJob> {
        Ok(SyncJob {
            id: id.to_string(),
            area: self.area.clone(),
            schedule: schedule.to_string(),
            source_connection: self.source.connection_string.clone(),
            source_access_token: token_for(&self.source, tokens)?,
            target_connection: self.target.connection_string.clone(),
            target_access_token: token_for(&self.target, tokens)?,
            tables: self
                .resolved_tables()
                .into_values()
                .map(|t| SyncJobTable {
                    source: t.source,
                    target: t.target,
                    disable_target_identity_insert: t.disable_target_identity_insert,
                })
                .collect(),
            batch_size: self.batch_size,
            expires,
            seed,
            global_change_tracking: self.global_change_tracking,
        })
    }
}
