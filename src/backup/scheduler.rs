//! Timer-driven backup runs.
//!
//! An explicit recurring task with its own cancellation token. A tick that
//! lands while another run holds the manager's run-lock is skipped and
//! logged, never queued.

use super::{BackupError, BackupKind, BackupManager};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cron expressions per backup kind (6-field, with seconds).
#[derive(Debug, Clone)]
pub struct BackupSchedule {
    pub daily: String,
    pub weekly: String,
}

impl Default for BackupSchedule {
    fn default() -> Self {
        Self {
            // Every day at 02:00, every Sunday at 03:00.
            daily: "0 0 2 * * *".to_string(),
            weekly: "0 0 3 * * Sun".to_string(),
        }
    }
}

impl BackupSchedule {
    pub fn validate(&self) -> anyhow::Result<()> {
        CronSchedule::from_str(&self.daily)
            .map_err(|e| anyhow::anyhow!("invalid daily backup cron '{}': {e}", self.daily))?;
        CronSchedule::from_str(&self.weekly)
            .map_err(|e| anyhow::anyhow!("invalid weekly backup cron '{}': {e}", self.weekly))?;
        Ok(())
    }
}

/// Main backup scheduler loop. Polls for due runs every 30 seconds until the
/// shutdown token fires.
pub async fn run_backup_loop(
    manager: Arc<BackupManager>,
    schedule: BackupSchedule,
    shutdown: CancellationToken,
) {
    let daily = match CronSchedule::from_str(&schedule.daily) {
        Ok(s) => s,
        Err(e) => {
            error!("Invalid daily backup cron, scheduler not started: {e}");
            return;
        }
    };
    let weekly = match CronSchedule::from_str(&schedule.weekly) {
        Ok(s) => s,
        Err(e) => {
            error!("Invalid weekly backup cron, scheduler not started: {e}");
            return;
        }
    };

    info!("Backup scheduler started");
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    let mut last_tick = Utc::now();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => {
                info!("Backup scheduler stopping");
                return;
            }
        }

        let now = Utc::now();
        if is_due(&daily, last_tick, now) {
            run_scheduled(&manager, BackupKind::Daily).await;
        }
        if is_due(&weekly, last_tick, now) {
            run_scheduled(&manager, BackupKind::Weekly).await;
        }
        last_tick = now;
    }
}

fn is_due(schedule: &CronSchedule, last_tick: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    schedule
        .after(&last_tick)
        .next()
        .map(|next| next <= now)
        .unwrap_or(false)
}

async fn run_scheduled(manager: &BackupManager, kind: BackupKind) {
    let description = format!("scheduled {kind} backup at {}", Utc::now().to_rfc3339());
    match manager.create_backup(kind, &description).await {
        Ok(backup) => info!(backup = %backup.id, %kind, "Scheduled backup complete"),
        Err(BackupError::Busy) => {
            warn!(%kind, "Scheduled backup skipped, another run in progress")
        }
        Err(e) => error!(%kind, "Scheduled backup failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_schedule_is_valid() {
        BackupSchedule::default().validate().unwrap();
    }

    #[test]
    fn test_bad_schedule_rejected() {
        let schedule = BackupSchedule {
            daily: "not a cron".into(),
            weekly: "0 0 3 * * Sun".into(),
        };
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_is_due_fires_once_per_window() {
        let daily = CronSchedule::from_str("0 0 2 * * *").unwrap();
        let before = Utc.with_ymd_and_hms(2026, 8, 25, 1, 59, 40).unwrap();
        let hit = Utc.with_ymd_and_hms(2026, 8, 25, 2, 0, 10).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 8, 25, 2, 0, 40).unwrap();

        assert!(is_due(&daily, before, hit));
        // The next window starts after the hit; nothing further is due yet.
        assert!(!is_due(&daily, hit, later));
    }
}
