//! pipewarden -- CI/CD pipeline security analysis.
//!
//! This crate provides the core library for scanning pipeline definitions,
//! build metadata, and build logs against a categorized rule set, scoring the
//! risk, alerting at most once per build event, and snapshotting persisted
//! state with retention.

pub mod alert;
pub mod backup;
pub mod config;
pub mod dedup;
pub mod pipeline;
pub mod rules;
pub mod scan;
pub mod storage;

use crate::alert::{Dispatcher, NotifyTransport};
use crate::backup::manager::BackupPaths;
use crate::backup::scheduler::BackupSchedule;
use crate::backup::BackupManager;
use crate::config::Config;
use crate::dedup::DedupStore;
use crate::pipeline::Pipeline;
use crate::rules::RuleStore;
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a running analyzer needs, wired from one [`Config`].
pub struct App {
    pub pipeline: Arc<Pipeline>,
    pub dedup: DedupStore,
    pub backups: Arc<BackupManager>,
    pub rules: Arc<RuleStore>,
    pub pool: storage::Pool,
    pub shutdown: CancellationToken,
}

impl App {
    /// Wire storage, rules, dedup, dispatch, and backups together.
    pub fn build(config: &Config, transport: Arc<dyn NotifyTransport>) -> Result<Self> {
        let db_path = config.database_path.to_string_lossy().into_owned();
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = storage::open_pool(&db_path)?;

        let rules = Arc::new(RuleStore::open(&config.rules_path, &config.whitelist_path)?);
        let dedup = DedupStore::new(pool.clone());
        let shutdown = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            dedup.clone(),
            shutdown.clone(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            rules.clone(),
            pool.clone(),
            dedup.clone(),
            dispatcher,
        ));

        let backups = Arc::new(BackupManager::new(
            BackupPaths {
                backup_dir: config.backup_dir.clone(),
                db_path: config.database_path.clone(),
                logs_dir: config.logs_dir.clone(),
                restore_dir: config.restore_dir.clone(),
            },
            config.retention.clone(),
        ));

        Ok(Self {
            pipeline,
            dedup,
            backups,
            rules,
            pool,
            shutdown,
        })
    }

    /// Start the background backup scheduler for this app.
    pub fn spawn_backup_scheduler(&self, config: &Config) -> Result<()> {
        let schedule = BackupSchedule {
            daily: config.daily_backup_cron.clone(),
            weekly: config.weekly_backup_cron.clone(),
        };
        schedule.validate()?;

        let manager = self.backups.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            backup::scheduler::run_backup_loop(manager, schedule, shutdown).await;
        });
        Ok(())
    }
}
