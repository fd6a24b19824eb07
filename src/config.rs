//! Configuration file loading.

use crate::backup::RetentionPolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration, read from a TOML file with sane defaults for
/// every field. The Slack webhook URL may also come from the
/// `PIPEWARDEN_WEBHOOK_URL` environment variable, which wins over the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    pub rules_path: PathBuf,
    pub whitelist_path: PathBuf,
    pub logs_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub restore_dir: PathBuf,
    pub slack_webhook_url: Option<String>,
    /// Seconds a PENDING dedup record may sit before the recovery sweep
    /// re-claims it.
    pub pending_timeout_secs: u64,
    pub retention: RetentionPolicy,
    pub daily_backup_cron: String,
    pub weekly_backup_cron: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/pipewarden.db"),
            rules_path: PathBuf::from("config/patterns/blacklist.json"),
            whitelist_path: PathBuf::from("config/patterns/whitelist.json"),
            logs_dir: PathBuf::from("logs"),
            backup_dir: PathBuf::from("backups"),
            restore_dir: PathBuf::from("restore"),
            slack_webhook_url: None,
            pending_timeout_secs: 600,
            retention: RetentionPolicy::default(),
            daily_backup_cron: "0 0 2 * * *".to_string(),
            weekly_backup_cron: "0 0 3 * * Sun".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var("PIPEWARDEN_WEBHOOK_URL") {
            if !url.is_empty() {
                config.slack_webhook_url = Some(url);
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/pipewarden.toml")).unwrap();
        assert_eq!(config.retention.manual, 5);
        assert_eq!(config.pending_timeout_secs, 600);
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipewarden.toml");
        std::fs::write(
            &path,
            "pending_timeout_secs = 120\n\n[retention]\nmanual = 3\ndaily = 7\nweekly = 4\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pending_timeout_secs, 120);
        assert_eq!(config.retention.manual, 3);
        assert_eq!(config.retention.daily, 7);
        assert_eq!(config.database_path, PathBuf::from("data/pipewarden.db"));
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipewarden.toml");
        std::fs::write(&path, "retention = \"oops").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
