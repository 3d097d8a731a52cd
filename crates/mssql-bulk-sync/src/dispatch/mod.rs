//! Turning triggers into jobs, and jobs into runs.
//!
//! A trigger (a named schedule firing, or an on-demand request for one job)
//! resolves configuration into [`SyncJob`]s with tokens attached and an
//! absolute expiry, and puts them on a [`JobQueue`]. A worker takes each job
//! off the queue and hands it to [`consume`].

pub mod queue;
pub mod schedule;

pub use queue::{ChannelQueue, JobQueue};
pub use schedule::Schedule;

use crate::auth::{AccessTokenProvider, TokenCache};
use crate::config::{SyncJobConfig, SyncJobsConfig};
use crate::error::Result;
use crate::job::SyncJob;
use crate::orchestrator::{Connector, JobRun, Orchestrator};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Schedule name recorded on on-demand jobs.
pub const MANUAL_SCHEDULE: &str = "manual";

/// Result of an on-demand request.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// No job with that id in that area.
    NotFound,
    Accepted(SyncJob),
}

/// Resolves jobs from configuration for schedules and on-demand requests.
pub struct Dispatcher<P> {
    config: Arc<SyncJobsConfig>,
    tokens: Arc<TokenCache<P>>,
}

impl<P: AccessTokenProvider> Dispatcher<P> {
    pub fn new(config: Arc<SyncJobsConfig>, tokens: Arc<TokenCache<P>>) -> Self {
        Self { config, tokens }
    }

    pub fn config(&self) -> &SyncJobsConfig {
        &self.config
    }

    fn expires(&self) -> DateTime<Utc> {
        Utc::now() + Duration::minutes(self.config.settings.job_expiry_minutes)
    }

    /// Jobs to run for one firing of `schedule`.
    ///
    /// A late firing produces nothing. Failures are logged and also produce
    /// nothing; the next firing tries again.
    pub async fn evaluate_schedule(&self, schedule: Schedule, past_due: bool) -> Vec<SyncJob> {
        if past_due {
            warn!("Schedule {} fired late, skipping this occurrence", schedule);
            return Vec::new();
        }

        let jobs = self.config.scheduled_jobs(schedule);
        if jobs.is_empty() {
            info!("No jobs configured for schedule {}", schedule);
            return Vec::new();
        }

        match self.resolve_scheduled(schedule, &jobs).await {
            Ok(resolved) => {
                info!("Schedule {} produced {} job(s)", schedule, resolved.len());
                resolved
            }
            Err(e) => {
                error!("Failed to resolve jobs for schedule {}: {}", schedule, e);
                Vec::new()
            }
        }
    }

    async fn resolve_scheduled(
        &self,
        schedule: Schedule,
        jobs: &[(&str, &SyncJobConfig)],
    ) -> Result<Vec<SyncJob>> {
        // One token pass for every configured data source.
        let tokens = self
            .tokens
            .get_token_cache(self.config.jobs.values().flat_map(|job| job.data_sources()))
            .await?;
        let expires = self.expires();
        jobs.iter()
            .map(|(id, job)| job.to_sync_job(id, schedule.as_str(), &tokens, expires, false))
            .collect()
    }

    /// Evaluate `schedule` and queue every resulting job. Returns how many
    /// were queued.
    pub async fn dispatch_schedule<Q>(&self, schedule: Schedule, past_due: bool, queue: &Q) -> Result<usize>
    where
        Q: JobQueue + ?Sized,
    {
        let jobs = self.evaluate_schedule(schedule, past_due).await;
        let count = jobs.len();
        for job in jobs {
            queue.send(job).await?;
        }
        Ok(count)
    }

    /// Resolve one job on demand. `None` when the area has no such job.
    pub async fn resolve(&self, area: &str, id: &str, seed: bool) -> Result<Option<SyncJob>> {
        let Some(config) = self.config.find_job(area, id) else {
            warn!("No job {} in area {}", id, area);
            return Ok(None);
        };

        let tokens = self.tokens.get_token_cache(config.data_sources()).await?;
        let job = config.to_sync_job(id, MANUAL_SCHEDULE, &tokens, self.expires(), seed)?;
        Ok(Some(job))
    }

    /// Queue one job on demand.
    pub async fn enqueue<Q>(&self, area: &str, id: &str, seed: bool, queue: &Q) -> Result<EnqueueOutcome>
    where
        Q: JobQueue + ?Sized,
    {
        let Some(job) = self.resolve(area, id, seed).await? else {
            return Ok(EnqueueOutcome::NotFound);
        };
        queue.send(job.clone()).await?;
        info!(job = %job.id, seed, "Accepted job {} in area {}", id, area);
        Ok(EnqueueOutcome::Accepted(job))
    }
}

/// Run one job taken off the queue.
///
/// Soft failures (an expired job) are logged and yield `None` without
/// touching either database.
pub async fn consume<C: Connector>(orchestrator: &Orchestrator<C>, job: &SyncJob) -> Result<Option<JobRun>> {
    match orchestrator.execute(job).await {
        Ok(run) => Ok(Some(run)),
        Err(e) if e.is_soft() => {
            warn!("Discarding job {} ({}): {}", job.id, job.schedule, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
