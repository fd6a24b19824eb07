//! Backup and retention -- versioned snapshots of the findings database and logs.

pub mod manager;
pub mod scheduler;

pub use self::manager::BackupManager;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    /// Another run holds the run-lock. Scheduled runs skip, never queue.
    #[error("another backup run is in progress")]
    Busy,
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("backup '{0}' not found")]
    NotFound(String),
    #[error("backup '{id}' is corrupt: {detail}")]
    Corrupt { id: String, detail: String },
    #[error("restore I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Retention class of a snapshot. Each kind keeps its own count.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    Daily,
    Weekly,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Daily => "daily",
            BackupKind::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(BackupKind::Manual),
            "daily" => Some(BackupKind::Daily),
            "weekly" => Some(BackupKind::Weekly),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata record written inside every archive before sealing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub kind: BackupKind,
    pub description: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Relative paths of every archived file, in archive order.
    pub files: Vec<String>,
    /// path -> sha256 of the source file at snapshot time.
    pub checksums: std::collections::BTreeMap<String, String>,
    pub database_size: u64,
    pub logs_size: u64,
}

/// A sealed backup as seen in the backup directory.
#[derive(Debug, Clone, Serialize)]
pub struct Backup {
    /// Archive file stem, e.g. `backup_20260825_020000_123456_daily`.
    pub id: String,
    pub path: PathBuf,
    pub kind: BackupKind,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub file_manifest: Vec<String>,
    pub size_bytes: u64,
    pub description: String,
}

/// Backup run state machine. A run walks
/// `Idle -> Snapshotting -> Sealed -> Pruning -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Snapshotting,
    Sealed,
    Pruning,
}

/// Per-kind retention counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub manual: usize,
    pub daily: usize,
    pub weekly: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            manual: 5,
            daily: 5,
            weekly: 5,
        }
    }
}

impl RetentionPolicy {
    pub fn max_for(&self, kind: BackupKind) -> usize {
        match kind {
            BackupKind::Manual => self.manual,
            BackupKind::Daily => self.daily,
            BackupKind::Weekly => self.weekly,
        }
    }
}

/// Decide which backups of a kind to evict: everything beyond the newest
/// `max`, oldest first. Pure function over the listed set.
pub fn retention_victims(mut backups: Vec<Backup>, max: usize) -> Vec<Backup> {
    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if backups.len() <= max {
        return Vec::new();
    }
    backups.split_off(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn backup(id: &str, secs: i64) -> Backup {
        Backup {
            id: id.into(),
            path: PathBuf::from(format!("{id}.zip")),
            kind: BackupKind::Manual,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            file_manifest: vec![],
            size_bytes: 0,
            description: String::new(),
        }
    }

    #[test]
    fn test_retention_keeps_newest_max() {
        let set = vec![
            backup("b3", 300),
            backup("b1", 100),
            backup("b5", 500),
            backup("b2", 200),
            backup("b4", 400),
            backup("b6", 600),
        ];
        let victims = retention_victims(set, 5);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].id, "b1");
    }

    #[test]
    fn test_retention_noop_under_max() {
        let set = vec![backup("b1", 100), backup("b2", 200)];
        assert!(retention_victims(set, 5).is_empty());
    }

    #[test]
    fn test_retention_evicts_oldest_first() {
        let set = (1..=8).map(|i| backup(&format!("b{i}"), i * 100)).collect();
        let victims = retention_victims(set, 5);
        let ids: Vec<&str> = victims.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["b3", "b2", "b1"]);
    }
}
