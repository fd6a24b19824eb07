//! Risk aggregation -- reduce a finding set to a score and level.

use super::{Finding, RiskLevel};

/// Reduce findings to `(risk_score, risk_level)`.
///
/// The score is the maximum severity weight present, not a sum: one critical
/// finding dominates no matter how many low-severity matches accompany it, so
/// verbose-but-benign artifacts cannot inflate their way into an alert.
pub fn aggregate(findings: &[Finding]) -> (u8, RiskLevel) {
    let score = findings
        .iter()
        .map(|f| f.severity_weight)
        .max()
        .unwrap_or(0);
    (score, level_for(score, findings.is_empty()))
}

fn level_for(score: u8, empty: bool) -> RiskLevel {
    if empty {
        RiskLevel::Clean
    } else if score >= 9 {
        RiskLevel::Critical
    } else if score >= 7 {
        RiskLevel::High
    } else if score >= 4 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}
