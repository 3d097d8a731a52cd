//! Job queue seam.

use crate::error::{Result, SyncError};
use crate::job::SyncJob;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Where triggers put resolved jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(&self, job: SyncJob) -> Result<()>;
}

/// In-process queue over a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<SyncJob>,
}

impl ChannelQueue {
    /// Queue plus the receiving end workers consume from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SyncJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn send(&self, job: SyncJob) -> Result<()> {
        debug!("Queueing job {} ({})", job.id, job.schedule);
        self.tx
            .send(job)
            .await
            .map_err(|e| SyncError::Queue(format!("queue closed, dropped job {}", e.0.id)))
    }
}
