//! Rule store -- owns the active [`RuleSet`] and swaps it atomically on reload.

use super::{ConfigError, RuleDef, RuleSet, WhitelistDef};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

/// On-disk shape of the blacklist/whitelist config files.
#[derive(Debug, Deserialize)]
struct RuleFile {
    patterns: Vec<RuleDef>,
}

#[derive(Debug, Deserialize)]
struct WhitelistFile {
    #[serde(default)]
    patterns: Vec<WhitelistDef>,
}

/// Holds the active rule set behind an atomically swappable handle.
///
/// Scans take a snapshot via [`current`](RuleStore::current) and keep using it
/// even if a reload lands mid-scan; the swap never mutates rules in place.
pub struct RuleStore {
    active: RwLock<Arc<RuleSet>>,
    rules_path: PathBuf,
    whitelist_path: PathBuf,
}

impl RuleStore {
    /// Load both config files and build the initial rule set.
    pub fn open(rules_path: &Path, whitelist_path: &Path) -> Result<Self, ConfigError> {
        let set = Self::load_files(rules_path, whitelist_path)?;
        info!(
            rules = set.rule_count(),
            whitelist = set.whitelist().len(),
            "Rule set loaded"
        );
        Ok(Self {
            active: RwLock::new(Arc::new(set)),
            rules_path: rules_path.to_path_buf(),
            whitelist_path: whitelist_path.to_path_buf(),
        })
    }

    /// Build a store from already-parsed definitions. Used by tests and by
    /// callers that source rules from somewhere other than the filesystem.
    pub fn from_defs(rules: &[RuleDef], whitelist: &[WhitelistDef]) -> Result<Self, ConfigError> {
        let set = RuleSet::load(rules, whitelist)?;
        Ok(Self {
            active: RwLock::new(Arc::new(set)),
            rules_path: PathBuf::new(),
            whitelist_path: PathBuf::new(),
        })
    }

    /// Snapshot of the active rule set.
    pub fn current(&self) -> Arc<RuleSet> {
        self.active.read().expect("rule store lock poisoned").clone()
    }

    /// Re-read the config files and swap the active set atomically.
    ///
    /// On any load error the previous set stays active untouched.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let set = Self::load_files(&self.rules_path, &self.whitelist_path)?;
        let count = set.rule_count();
        *self.active.write().expect("rule store lock poisoned") = Arc::new(set);
        info!(rules = count, "Rule set reloaded");
        Ok(())
    }

    fn load_files(rules_path: &Path, whitelist_path: &Path) -> Result<RuleSet, ConfigError> {
        let raw = std::fs::read_to_string(rules_path)?;
        let rule_file: RuleFile = serde_json::from_str(&raw)?;

        let whitelist_file: WhitelistFile = if whitelist_path.exists() {
            let raw = std::fs::read_to_string(whitelist_path)?;
            serde_json::from_str(&raw)?
        } else {
            WhitelistFile { patterns: Vec::new() }
        };

        RuleSet::load(&rule_file.patterns, &whitelist_file.patterns)
    }
}
