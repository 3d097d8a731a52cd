//! Configuration loading, validation and job lookup.

mod types;
mod validation;

pub use types::*;

use crate::dispatch::Schedule;
use crate::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

impl SyncJobsConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SyncJobsConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Distinct, non-empty areas in job id order.
    pub fn list_areas(&self) -> Vec<String> {
        let mut areas: Vec<String> = Vec::new();
        for job in self.jobs.values() {
            let Some(area) = job.area.as_deref().map(str::trim).filter(|a| !a.is_empty()) else {
                continue;
            };
            if !areas.iter().any(|a| a.eq_ignore_ascii_case(area)) {
                areas.push(area.to_string());
            }
        }
        areas
    }

    /// Job ids belonging to an area.
    pub fn list_ids(&self, area: &str) -> Vec<String> {
        if area.trim().is_empty() {
            return Vec::new();
        }
        self.jobs
            .iter()
            .filter(|(_, job)| job.in_area(area))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Look up a job by area and id. `None` for unknown combinations.
    pub fn find_job(&self, area: &str, id: &str) -> Option<&SyncJobConfig> {
        if area.trim().is_empty() || id.trim().is_empty() {
            return None;
        }
        self.jobs.get(id).filter(|job| job.in_area(area))
    }

    /// Jobs that run on the given schedule.
    ///
    /// A non-manual job without schedule flags runs on [`Schedule::Custom`].
    pub fn scheduled_jobs(&self, schedule: Schedule) -> Vec<(&str, &SyncJobConfig)> {
        self.jobs
            .iter()
            .filter(|(_, job)| !job.manual)
            .filter(|(_, job)| {
                let enabled: Vec<&String> = job
                    .schedules
                    .iter()
                    .filter(|(_, on)| **on)
                    .map(|(name, _)| name)
                    .collect();
                if enabled.is_empty() {
                    schedule == Schedule::Custom
                } else {
                    enabled
                        .iter()
                        .any(|name| name.parse::<Schedule>().ok() == Some(schedule))
                }
            })
            .map(|(id, job)| (id.as_str(), job))
            .collect()
    }
}

/// Resolved table entry as shown by job inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncJobConfigTable {
    pub source: String,
    pub target: String,
    pub disable_target_identity_insert: bool,
}

/// Read-only view of one job's configuration.
#[derive(Debug, Clone, Serialize)]
pub struct SyncJobConfigResponse {
    pub id: String,
    pub area: Option<String>,
    pub batch_size: Option<usize>,
    pub manual: bool,
    pub schedules: BTreeMap<String, bool>,
    pub tables: BTreeMap<String, SyncJobConfigTable>,
}

impl SyncJobConfig {
    /// Resolve table keys into source/target/identity-insert triples.
    pub fn resolved_tables(&self) -> BTreeMap<String, SyncJobConfigTable> {
        self.tables
            .iter()
            .map(|(key, source)| {
                let target = self
                    .target_tables
                    .get(key)
                    .map(|t| t.trim())
                    .filter(|t| !t.is_empty())
                    .unwrap_or(source.as_str())
                    .to_string();
                let disable = self
                    .disable_target_identity_insert_tables
                    .get(key)
                    .copied()
                    .unwrap_or(false);
                (
                    key.clone(),
                    SyncJobConfigTable {
                        source: source.clone(),
                        target,
                        disable_target_identity_insert: disable,
                    },
                )
            })
            .collect()
    }

    /// Describe this job for inspection. Never includes connection strings.
    pub fn describe(&self, id: &str) -> SyncJobConfigResponse {
        SyncJobConfigResponse {
            id: id.to_string(),
            area: self.area.clone(),
            batch_size: self.batch_size,
            manual: self.manual,
            schedules: self.schedules.clone(),
            tables: self.resolved_tables(),
        }
    }
}
