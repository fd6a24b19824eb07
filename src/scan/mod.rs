//! Artifact scanning -- pattern matching, whitelist filtering, risk scoring.

pub mod aggregate;
pub mod engine;
pub mod whitelist;

use crate::rules::RuleCategory;
use serde::{Deserialize, Serialize};

/// Which class of artifact a text came from. Selects log pre-slicing and is
/// recorded with the analysis row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Definition,
    Build,
    Log,
}

impl ArtifactKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "definition" => Some(ArtifactKind::Definition),
            "build" => Some(ArtifactKind::Build),
            "log" => Some(ArtifactKind::Log),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactKind::Definition => "definition",
            ArtifactKind::Build => "build",
            ArtifactKind::Log => "log",
        };
        f.write_str(s)
    }
}

/// Lexically sniffed script dialect, recorded for reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    PowerShell,
    Bash,
    Python,
    Unknown,
}

impl ScriptType {
    pub fn parse(s: &str) -> Self {
        match s {
            "PowerShell" => ScriptType::PowerShell,
            "Bash" => ScriptType::Bash,
            "Python" => ScriptType::Python,
            _ => ScriptType::Unknown,
        }
    }
}

/// A single rule match against artifact text.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub rule_id: String,
    pub category: RuleCategory,
    /// All match sites for this rule, (offset, length). Overlapping sites are
    /// collapsed; the first one is the representative span.
    pub spans: Vec<(usize, usize)>,
    /// Text of the first match site, used for whitelist scoping and excerpts.
    pub matched_text: String,
    pub severity_weight: u8,
}

impl Finding {
    pub fn span(&self) -> (usize, usize) {
        self.spans.first().copied().unwrap_or((0, 0))
    }
}

/// Ordinal risk summary of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Clean,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn parse(s: &str) -> Self {
        match s {
            "LOW" => RiskLevel::Low,
            "MEDIUM" => RiskLevel::Medium,
            "HIGH" => RiskLevel::High,
            "CRITICAL" => RiskLevel::Critical,
            _ => RiskLevel::Clean,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Clean => "CLEAN",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// The scored outcome of scanning one artifact.
#[derive(Debug, Serialize)]
pub struct ArtifactScanResult {
    pub artifact_id: String,
    pub kind: ArtifactKind,
    pub script_type: ScriptType,
    pub findings: Vec<Finding>,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
}

impl ArtifactScanResult {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}
