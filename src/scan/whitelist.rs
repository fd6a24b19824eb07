//! Whitelist filter -- scoped suppression of findings.

use super::Finding;
use crate::rules::{RuleSet, WhitelistEntry, WhitelistScope};
use tracing::debug;

/// Drop findings covered by a whitelist entry.
///
/// Suppression is scoped, not blanket: the entry's scope must cover the
/// finding (exact rule id, same category, or global) AND the entry's own
/// matcher must match the finding's matched text. A dangerous use inside an
/// otherwise-whitelisted context therefore still surfaces. When several
/// entries cover the same finding the most specific scope wins for
/// attribution: rule over category over global.
pub fn filter(findings: Vec<Finding>, ruleset: &RuleSet) -> Vec<Finding> {
    if ruleset.whitelist().is_empty() {
        return findings;
    }

    findings
        .into_iter()
        .filter(|finding| match suppressing_entry(finding, ruleset) {
            Some(entry) => {
                debug!(
                    rule = %finding.rule_id,
                    whitelist = %entry.id,
                    reason = %entry.reason,
                    "Finding suppressed by whitelist"
                );
                false
            }
            None => true,
        })
        .collect()
}

fn suppressing_entry<'a>(finding: &Finding, ruleset: &'a RuleSet) -> Option<&'a WhitelistEntry> {
    let mut best: Option<&WhitelistEntry> = None;
    for entry in ruleset.whitelist() {
        let applies = match &entry.scope {
            WhitelistScope::Rule(id) => *id == finding.rule_id,
            WhitelistScope::Category(cat) => *cat == finding.category,
            WhitelistScope::Global => true,
        };
        if !applies || !entry.matcher.is_match(&finding.matched_text) {
            continue;
        }
        best = match best {
            Some(current) if specificity(&current.scope) >= specificity(&entry.scope) => Some(current),
            _ => Some(entry),
        };
    }
    best
}

fn specificity(scope: &WhitelistScope) -> u8 {
    match scope {
        WhitelistScope::Rule(_) => 2,
        WhitelistScope::Category(_) => 1,
        WhitelistScope::Global => 0,
    }
}
