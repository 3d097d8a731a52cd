//! Configuration validation.

use super::{DataSourceConfig, SyncJobsConfig};
use crate::dispatch::Schedule;
use crate::error::{Result, SyncError};

/// Validate the configuration.
pub fn validate(config: &SyncJobsConfig) -> Result<()> {
    let settings = &config.settings;
    if settings.default_batch_size == 0 {
        return Err(SyncError::Config(
            "settings.default_batch_size must be at least 1".into(),
        ));
    }
    if settings.job_expiry_minutes <= 0 {
        return Err(SyncError::Config(
            "settings.job_expiry_minutes must be positive".into(),
        ));
    }
    for (name, secs) in [
        ("schema_query_timeout_secs", settings.schema_query_timeout_secs),
        ("bulk_timeout_secs", settings.bulk_timeout_secs),
        ("apply_timeout_secs", settings.apply_timeout_secs),
        ("connect_timeout_secs", settings.connect_timeout_secs),
    ] {
        if secs == 0 {
            return Err(SyncError::Config(format!(
                "settings.{} must be at least 1",
                name
            )));
        }
    }
    if settings.token_concurrency == 0 {
        return Err(SyncError::Config(
            "settings.token_concurrency must be at least 1".into(),
        ));
    }
    if settings.token_refresh_margin_secs < 0 {
        return Err(SyncError::Config(
            "settings.token_refresh_margin_secs must not be negative".into(),
        ));
    }
    crate::core::identifier::validate_identifier(&settings.sync_schema)
        .map_err(|e| SyncError::Config(format!("settings.sync_schema: {}", e)))?;

    if config.jobs.is_empty() {
        return Err(SyncError::Config("at least one job is required".into()));
    }

    for (id, job) in &config.jobs {
        if id.trim().is_empty() {
            return Err(SyncError::Config("job id must not be empty".into()));
        }
        validate_data_source(id, "source", &job.source)?;
        validate_data_source(id, "target", &job.target)?;

        if job.tables.is_empty() {
            return Err(SyncError::Config(format!(
                "jobs.{}.tables must list at least one table",
                id
            )));
        }
        for (key, table) in &job.tables {
            if table.trim().is_empty() {
                return Err(SyncError::Config(format!(
                    "jobs.{}.tables.{} must name a table",
                    id, key
                )));
            }
        }
        for key in job.target_tables.keys() {
            if !job.tables.contains_key(key) {
                return Err(SyncError::Config(format!(
                    "jobs.{}.target_tables.{} has no matching entry in tables",
                    id, key
                )));
            }
        }
        for key in job.disable_target_identity_insert_tables.keys() {
            if !job.tables.contains_key(key) {
                return Err(SyncError::Config(format!(
                    "jobs.{}.disable_target_identity_insert_tables.{} has no matching entry in tables",
                    id, key
                )));
            }
        }
        if let Some(0) = job.batch_size {
            return Err(SyncError::Config(format!(
                "jobs.{}.batch_size must be at least 1",
                id
            )));
        }
        for name in job.schedules.keys() {
            name.parse::<Schedule>()
                .map_err(|e| SyncError::Config(format!("jobs.{}.schedules: {}", id, e)))?;
        }
    }

    Ok(())
}

fn validate_data_source(id: &str, side: &str, source: &DataSourceConfig) -> Result<()> {
    if source.connection_string.trim().is_empty() {
        return Err(SyncError::Config(format!(
            "jobs.{}.{}.connection_string is required",
            id, side
        )));
    }
    if source.managed_identity && source.token_key().is_none() {
        return Err(SyncError::Config(format!(
            "jobs.{}.{}.tenant_id is required when managed_identity is set",
            id, side
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncJobConfig, SyncSettings};
    use std::collections::BTreeMap;

    fn data_source(db: &str) -> DataSourceConfig {
        DataSourceConfig {
            connection_string: format!("Server=tcp:localhost,1433;Database={};User Id=sa;Password=pw", db),
            managed_identity: false,
            tenant_id: None,
        }
    }

    fn valid_config() -> SyncJobsConfig {
        let mut tables = BTreeMap::new();
        tables.insert("orders".to_string(), "[dbo].[Orders]".to_string());
        let mut jobs = BTreeMap::new();
        jobs.insert(
            "orders".to_string(),
            SyncJobConfig {
                area: Some("sales".to_string()),
                source: data_source("Shop"),
                target: data_source("ShopCopy"),
                tables,
                target_tables: BTreeMap::new(),
                disable_target_identity_insert_tables: BTreeMap::new(),
                batch_size: None,
                manual: false,
                schedules: BTreeMap::new(),
                global_change_tracking: true,
            },
        );
        SyncJobsConfig {
            settings: SyncSettings::default(),
            jobs,
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_no_jobs() {
        let mut config = valid_config();
        config.jobs.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_connection_string() {
        let mut config = valid_config();
        config.jobs.get_mut("orders").unwrap().target.connection_string = " ".into();
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("jobs.orders.target.connection_string"));
    }

    #[test]
    fn test_managed_identity_requires_tenant() {
        let mut config = valid_config();
        config.jobs.get_mut("orders").unwrap().source.managed_identity = true;
        assert!(validate(&config).is_err());

        config.jobs.get_mut("orders").unwrap().source.tenant_id = Some("tenant".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_override_without_table() {
        let mut config = valid_config();
        config
            .jobs
            .get_mut("orders")
            .unwrap()
            .target_tables
            .insert("lines".into(), "[dbo].[Lines]".into());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_schedule() {
        let mut config = valid_config();
        config
            .jobs
            .get_mut("orders")
            .unwrap()
            .schedules
            .insert("weekly".into(), true);
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("weekly"));
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.jobs.get_mut("orders").unwrap().batch_size = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_timeout() {
        let mut config = valid_config();
        config.settings.bulk_timeout_secs = 0;
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("bulk_timeout_secs"));
    }
}
