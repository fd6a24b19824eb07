//! Detection rule model -- categories, rules, whitelist entries.

pub mod store;

pub use self::store::RuleStore;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pattern for rule '{id}': {source}")]
    BadPattern {
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate enabled rule id '{0}'")]
    DuplicateRuleId(String),
    #[error("severity weight {weight} out of range 1-10 for rule '{id}'")]
    SeverityOutOfRange { id: String, weight: u8 },
    #[error("failed to read rule file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse rule file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Closed set of detection categories. Severity thresholds and alert
/// summaries match exhaustively over this, so new categories are a
/// deliberate code change rather than a config typo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    CommandExecution,
    DynamicEvaluation,
    DownloadExecute,
    Obfuscation,
    CredentialAccess,
    FileTampering,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::CommandExecution => "command_execution",
            RuleCategory::DynamicEvaluation => "dynamic_evaluation",
            RuleCategory::DownloadExecute => "download_execute",
            RuleCategory::Obfuscation => "obfuscation",
            RuleCategory::CredentialAccess => "credential_access",
            RuleCategory::FileTampering => "file_tampering",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "command_execution" => Some(RuleCategory::CommandExecution),
            "dynamic_evaluation" => Some(RuleCategory::DynamicEvaluation),
            "download_execute" => Some(RuleCategory::DownloadExecute),
            "obfuscation" => Some(RuleCategory::Obfuscation),
            "credential_access" => Some(RuleCategory::CredentialAccess),
            "file_tampering" => Some(RuleCategory::FileTampering),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule definition as it appears in the blacklist config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    pub id: String,
    pub category: RuleCategory,
    pub pattern: String,
    pub severity: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

/// Whitelist scope, most specific first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhitelistScope {
    Rule(String),
    Category(RuleCategory),
    Global,
}

/// A whitelist definition as it appears in the whitelist config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistDef {
    pub id: String,
    pub scope: WhitelistScope,
    pub pattern: String,
    #[serde(default)]
    pub reason: String,
}

/// A compiled detection rule. Immutable after load.
#[derive(Debug)]
pub struct Rule {
    pub id: String,
    pub category: RuleCategory,
    pub raw_pattern: String,
    pub matcher: Regex,
    pub severity_weight: u8,
    pub enabled: bool,
}

/// A compiled suppression entry. Applied only to findings whose rule id or
/// category falls inside `scope`, and only when `matcher` also matches the
/// finding's own matched text.
#[derive(Debug)]
pub struct WhitelistEntry {
    pub id: String,
    pub scope: WhitelistScope,
    pub matcher: Regex,
    pub reason: String,
}

/// An immutable, validated set of rules and whitelist entries.
///
/// Iteration order is the insertion order of the source configuration, which
/// fixes the order of findings produced by a scan.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
    whitelist: Vec<WhitelistEntry>,
}

impl RuleSet {
    /// Compile rule and whitelist definitions into an active set.
    ///
    /// The whole load is rejected on the first bad pattern, duplicate enabled
    /// rule id, or out-of-range severity; no partial rule set is ever active.
    pub fn load(rule_defs: &[RuleDef], whitelist_defs: &[WhitelistDef]) -> Result<Self, ConfigError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut rules = Vec::with_capacity(rule_defs.len());

        for def in rule_defs {
            if def.enabled && !seen.insert(def.id.as_str()) {
                return Err(ConfigError::DuplicateRuleId(def.id.clone()));
            }
            if !(1..=10).contains(&def.severity) {
                return Err(ConfigError::SeverityOutOfRange {
                    id: def.id.clone(),
                    weight: def.severity,
                });
            }
            let matcher = compile_pattern(&def.id, &def.pattern)?;
            rules.push(Rule {
                id: def.id.clone(),
                category: def.category,
                raw_pattern: def.pattern.clone(),
                matcher,
                severity_weight: def.severity,
                enabled: def.enabled,
            });
        }

        let mut whitelist = Vec::with_capacity(whitelist_defs.len());
        for def in whitelist_defs {
            let matcher = compile_pattern(&def.id, &def.pattern)?;
            whitelist.push(WhitelistEntry {
                id: def.id.clone(),
                scope: def.scope.clone(),
                matcher,
                reason: def.reason.clone(),
            });
        }

        Ok(Self { rules, whitelist })
    }

    /// Enabled rules in insertion order.
    pub fn enabled_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn whitelist(&self) -> &[WhitelistEntry] {
        &self.whitelist
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

fn compile_pattern(id: &str, pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| ConfigError::BadPattern {
            id: id.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, pattern: &str, severity: u8) -> RuleDef {
        RuleDef {
            id: id.into(),
            category: RuleCategory::DynamicEvaluation,
            pattern: pattern.into(),
            severity,
            enabled: true,
            description: String::new(),
        }
    }

    #[test]
    fn test_load_rejects_bad_pattern() {
        let err = RuleSet::load(&[def("broken", "eval[(", 5)], &[]).unwrap_err();
        assert!(matches!(err, ConfigError::BadPattern { .. }));
    }

    #[test]
    fn test_load_rejects_duplicate_enabled_id() {
        let defs = vec![def("dup", "eval", 5), def("dup", "exec", 5)];
        let err = RuleSet::load(&defs, &[]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRuleId(id) if id == "dup"));
    }

    #[test]
    fn test_load_rejects_out_of_range_severity() {
        let err = RuleSet::load(&[def("hot", "eval", 11)], &[]).unwrap_err();
        assert!(matches!(err, ConfigError::SeverityOutOfRange { weight: 11, .. }));
    }

    #[test]
    fn test_disabled_duplicate_is_tolerated() {
        let mut retired = def("dup", "exec", 5);
        retired.enabled = false;
        let defs = vec![def("dup", "eval", 5), retired];
        let set = RuleSet::load(&defs, &[]).unwrap();
        assert_eq!(set.enabled_rules().count(), 1);
    }

    #[test]
    fn test_iteration_preserves_insertion_order() {
        let defs = vec![def("b", "bbb", 3), def("a", "aaa", 3), def("c", "ccc", 3)];
        let set = RuleSet::load(&defs, &[]).unwrap();
        let ids: Vec<&str> = set.enabled_rules().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}
