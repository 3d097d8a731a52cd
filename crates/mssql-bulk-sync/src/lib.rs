//! # mssql-bulk-sync
//!
//! Incremental SQL Server to SQL Server table sync driven by change tracking.
//!
//! For each configured table the engine compares the source's change
//! tracking version with the last version committed on the target and:
//!
//! - **Skips** tables that are already current
//! - **Stages** new/updated rows and deleted keys on the target with bulk
//!   loads, then deletes and merges them into the live table
//! - **Reconciles** full snapshots when the target was never synced or its
//!   version fell out of the source's retention window
//! - **Seeds** tables (truncate and reload) on request
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_bulk_sync::{consume, ChannelQueue, Dispatcher, Orchestrator, SyncJobsConfig};
//! use mssql_bulk_sync::auth::{ManagedIdentityTokenProvider, TokenCache};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> mssql_bulk_sync::Result<()> {
//!     let config = Arc::new(SyncJobsConfig::load("sync.yaml")?);
//!     let tokens = Arc::new(TokenCache::from_settings(
//!         ManagedIdentityTokenProvider::from_env(),
//!         &config.settings,
//!     ));
//!     let dispatcher = Dispatcher::new(config.clone(), tokens);
//!     let orchestrator = Orchestrator::new(&config.settings);
//!
//!     let (queue, mut jobs) = ChannelQueue::channel(16);
//!     dispatcher.enqueue("Sales", "orders", false, &queue).await?;
//!     drop(queue);
//!     while let Some(job) = jobs.recv().await {
//!         if let Some(run) = consume(&orchestrator, &job).await? {
//!             println!("{} rows copied", run.into_result()?.rows_copied());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod schema;
pub mod source;
pub mod state;
pub mod target;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use config::{DataSourceConfig, SyncJobConfig, SyncJobsConfig, SyncSettings};
pub use dispatch::{consume, ChannelQueue, Dispatcher, EnqueueOutcome, JobQueue, Schedule};
pub use error::{Result, SyncError};
pub use job::{SyncJob, SyncJobTable};
pub use orchestrator::{JobRun, Orchestrator, SyncJobResult, TableResult, TableStatus};
pub use schema::{Column, TableSchema, TableVersion};
pub use transfer::{TransferConfig, TransferEngine, TransferJob, TransferStats};
