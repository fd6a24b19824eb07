//! Alert formatting and dispatch.

pub mod dispatcher;
pub mod slack;

pub use self::dispatcher::Dispatcher;

use crate::dedup::EventIdentity;
use crate::rules::RuleCategory;
use crate::scan::{ArtifactScanResult, RiskLevel};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// How many of the highest-severity findings ride along in the payload.
const TOP_FINDINGS: usize = 5;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Worth retrying: network faults, timeouts, 5xx, throttling.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Not worth retrying: bad destination, rejected payload, auth.
    #[error("permanent transport failure: {0}")]
    Permanent(String),
}

/// Outbound notification transport. The HTTP/chat specifics live behind this
/// seam; the dispatcher only sees the retry classification.
#[async_trait]
pub trait NotifyTransport: Send + Sync {
    async fn send(&self, payload: &AlertPayload) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TopFinding {
    pub rule_id: String,
    pub category: RuleCategory,
    pub severity_weight: u8,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReference {
    pub source_system: String,
    pub build_id: String,
    pub definition_id: String,
}

/// The structured alert handed to the notification transport.
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub title: String,
    pub risk_level: RiskLevel,
    pub risk_score: u8,
    /// category -> finding count, stable order for rendering.
    pub findings_summary: BTreeMap<RuleCategory, usize>,
    pub top_findings: Vec<TopFinding>,
    pub build_reference: BuildReference,
}

impl AlertPayload {
    /// Build the payload from a scored scan result.
    pub fn from_result(result: &ArtifactScanResult, identity: &EventIdentity) -> Self {
        let mut findings_summary: BTreeMap<RuleCategory, usize> = BTreeMap::new();
        for finding in &result.findings {
            *findings_summary.entry(finding.category).or_default() += 1;
        }

        let mut ranked: Vec<&crate::scan::Finding> = result.findings.iter().collect();
        ranked.sort_by(|a, b| b.severity_weight.cmp(&a.severity_weight));
        let top_findings = ranked
            .into_iter()
            .take(TOP_FINDINGS)
            .map(|f| TopFinding {
                rule_id: f.rule_id.clone(),
                category: f.category,
                severity_weight: f.severity_weight,
                excerpt: f.matched_text.clone(),
            })
            .collect();

        Self {
            title: format!(
                "Pipeline security alert: {} risk in build {}",
                result.risk_level, identity.build_id
            ),
            risk_level: result.risk_level,
            risk_score: result.risk_score,
            findings_summary,
            top_findings,
            build_reference: BuildReference {
                source_system: identity.source_system.clone(),
                build_id: identity.build_id.clone(),
                definition_id: identity.definition_id.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{ArtifactKind, Finding, ScriptType};

    fn finding(id: &str, category: RuleCategory, severity: u8) -> Finding {
        Finding {
            rule_id: id.into(),
            category,
            spans: vec![(0, 4)],
            matched_text: format!("{id}-match"),
            severity_weight: severity,
        }
    }

    #[test]
    fn test_payload_summarizes_and_ranks() {
        let result = ArtifactScanResult {
            artifact_id: "def-10".into(),
            kind: ArtifactKind::Definition,
            script_type: ScriptType::Unknown,
            findings: vec![
                finding("low", RuleCategory::Obfuscation, 3),
                finding("crit", RuleCategory::DynamicEvaluation, 10),
                finding("crit2", RuleCategory::CommandExecution, 10),
                finding("mid", RuleCategory::Obfuscation, 5),
            ],
            risk_score: 10,
            risk_level: RiskLevel::Critical,
        };
        let identity = EventIdentity {
            source_system: "azure".into(),
            build_id: "42".into(),
            definition_id: "10".into(),
            content_hash: "aaa".into(),
        };

        let payload = AlertPayload::from_result(&result, &identity);
        assert_eq!(payload.risk_score, 10);
        assert_eq!(payload.findings_summary[&RuleCategory::Obfuscation], 2);
        assert_eq!(payload.top_findings[0].severity_weight, 10);
        assert!(payload.title.contains("CRITICAL"));
        assert_eq!(payload.build_reference.build_id, "42");
    }

    #[test]
    fn test_top_findings_bounded() {
        let findings = (0..10)
            .map(|i| finding(&format!("r{i}"), RuleCategory::CommandExecution, 5))
            .collect();
        let result = ArtifactScanResult {
            artifact_id: "a".into(),
            kind: ArtifactKind::Log,
            script_type: ScriptType::Bash,
            findings,
            risk_score: 5,
            risk_level: RiskLevel::Medium,
        };
        let identity = EventIdentity {
            source_system: "azure".into(),
            build_id: "1".into(),
            definition_id: "1".into(),
            content_hash: "h".into(),
        };
        let payload = AlertPayload::from_result(&result, &identity);
        assert_eq!(payload.top_findings.len(), TOP_FINDINGS);
    }
}
