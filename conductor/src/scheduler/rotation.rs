//! Cron-driven ConfigLog rotation.

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, instrument, warn};

use crate::config::RotationConfig;
use crate::database::Database;

pub struct ConfigRotation {
    db: Arc<Database>,
    policy: RotationConfig,
    scheduler: JobScheduler,
}

impl ConfigRotation {
    pub async fn new(db: Arc<Database>, policy: RotationConfig) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow!("Failed to create JobScheduler: {}", e))?;
        Ok(Self {
            db,
            policy,
            scheduler,
        })
    }

    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if !self.policy.enabled {
            warn!("ConfigLog rotation disabled - scheduler not started");
            return Ok(());
        }
        validate_6_field_cron(&self.policy.schedule)?;

        let db = self.db.clone();
        let policy = self.policy.clone();
        let job = Job::new_async(self.policy.schedule.as_str(), move |_uuid, _scheduler| {
            let db = db.clone();
            let policy = policy.clone();
            Box::pin(async move {
                if let Err(e) = rotate_once(&db, &policy).await {
                    error!("ConfigLog rotation failed: {}", e);
                }
            })
        })
        .map_err(|e| anyhow!("Invalid rotation schedule '{}': {}", self.policy.schedule, e))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| anyhow!("Failed to add rotation job to scheduler: {}", e))?;
        self.scheduler
            .start()
            .await
            .map_err(|e| anyhow!("Failed to start rotation scheduler: {}", e))?;
        info!("ConfigLog rotation scheduled: '{}'", self.policy.schedule);
        Ok(())
    }
}

/// Delete config logs older than `max_age_days`, keeping `keep_count` per root
pub async fn rotate_once(db: &Database, policy: &RotationConfig) -> Result<u64> {
    let cutoff = Utc::now() - Duration::days(policy.max_age_days);
    let removed = db.rotate_config_logs(cutoff, policy.keep_count).await?;
    if removed > 0 {
        info!("Rotated {} config log rows older than {}", removed, cutoff);
    }
    Ok(removed)
}

/// tokio-cron-scheduler wants `sec min hour day month dow`
pub fn validate_6_field_cron(schedule: &str) -> Result<()> {
    let parts: Vec<&str> = schedule.split_whitespace().collect();
    if parts.len() != 6 {
        return Err(anyhow!(
            "tokio-cron-scheduler requires exactly 6 fields: second minute hour day month dayofweek. Got {} fields: '{}'",
            parts.len(),
            schedule
        ));
    }

    validate_cron_field(parts[0], "second", 0, 59)?;
    validate_cron_field(parts[1], "minute", 0, 59)?;
    validate_cron_field(parts[2], "hour", 0, 23)?;
    validate_cron_field(parts[3], "day", 1, 31)?;
    validate_cron_field(parts[4], "month", 1, 12)?;
    validate_cron_field(parts[5], "dayofweek", 0, 7)?;
    Ok(())
}

fn validate_cron_field(field: &str, name: &str, min: u32, max: u32) -> Result<()> {
    if field == "*" || field == "?" {
        return Ok(());
    }

    let in_range = |value: u32| -> Result<()> {
        if value < min || value > max {
            return Err(anyhow!("{} value {} is outside valid range {}-{}", name, value, min, max));
        }
        Ok(())
    };
    let parse = |value: &str| -> Result<u32> {
        value
            .parse::<u32>()
            .map_err(|_| anyhow!("Invalid {} value: {}", name, value))
    };

    if let Some(step) = field.strip_prefix("*/") {
        if parse(step)? == 0 {
            return Err(anyhow!("{} step value cannot be 0", name));
        }
        return Ok(());
    }

    for part in field.split(',') {
        match part.split_once('-') {
            Some((start, end)) => {
                in_range(parse(start)?)?;
                in_range(parse(end)?)?;
            }
            None => in_range(parse(part)?)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0 0 3 * * *", true)]
    #[case("0 */15 * * * *", true)]
    #[case("0 0 1-5 * * 1,3,5", true)]
    #[case("0 0 3 * *", false)]
    #[case("0 61 3 * * *", false)]
    #[case("0 */0 * * * *", false)]
    #[case("0 0 x * * *", false)]
    fn test_cron_validation(#[case] schedule: &str, #[case] valid: bool) {
        assert_eq!(validate_6_field_cron(schedule).is_ok(), valid);
    }
}
