//! Opening the source and target side of a job.
//!
//! The orchestrator is generic over a [`Connector`] so that tests can run the
//! full per-table state machine against in-memory databases.

use crate::config::{SyncSettings, Timeouts};
use crate::core::MssqlPool;
use crate::error::Result;
use crate::job::SyncJob;
use crate::source::{MssqlSource, SourceDatabase};
use crate::target::{MssqlTarget, TargetDatabase};
use async_trait::async_trait;
use std::sync::Arc;

/// Opens one source and one target connection per job invocation.
#[async_trait]
pub trait Connector: Send + Sync {
    type Source: SourceDatabase;
    type Target: TargetDatabase;

    async fn connect_source(&self, job: &SyncJob) -> Result<Arc<Self::Source>>;

    async fn connect_target(&self, job: &SyncJob) -> Result<Arc<Self::Target>>;
}

/// Connects to SQL Server over tiberius.
#[derive(Debug, Clone)]
pub struct MssqlConnector {
    timeouts: Timeouts,
    sync_schema: String,
}

impl MssqlConnector {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            timeouts: settings.timeouts(),
            sync_schema: settings.sync_schema.clone(),
        }
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    type Source = MssqlSource;
    type Target = MssqlTarget;

    async fn connect_source(&self, job: &SyncJob) -> Result<Arc<MssqlSource>> {
        let pool = MssqlPool::connect(
            format!("source {}", job.source_label()),
            &job.source_connection,
            job.source_access_token.clone(),
            self.timeouts.connect,
        )
        .await?;
        Ok(Arc::new(MssqlSource::new(Arc::new(pool), self.timeouts)))
    }

    async fn connect_target(&self, job: &SyncJob) -> Result<Arc<MssqlTarget>> {
        let pool = MssqlPool::connect(
            format!("target {}", job.target_label()),
            &job.target_connection,
            job.target_access_token.clone(),
            self.timeouts.connect,
        )
        .await?;
        Ok(Arc::new(MssqlTarget::new(
            Arc::new(pool),
            &self.sync_schema,
            self.timeouts,
        )?))
    }
}
