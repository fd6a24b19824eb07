//! Event deduplication -- at-most-one alert per build event.

pub mod store;

pub use self::store::DedupStore;

use serde::{Deserialize, Serialize};

/// The dedup key plus diagnostic payload hash.
///
/// The key is `(source_system, build_id, definition_id)`. `content_hash` is
/// stored for diagnostics only: a redelivered webhook for the same build must
/// never double-alert even when its payload bytes differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventIdentity {
    pub source_system: String,
    pub build_id: String,
    pub definition_id: String,
    pub content_hash: String,
}

impl std::fmt::Display for EventIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.source_system, self.build_id, self.definition_id
        )
    }
}

/// Outcome of a claim attempt. `AlreadyClaimed` is normal control flow, not
/// an error: it routes to "skip, already alerted".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    Pending,
    Sent,
    Failed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "PENDING",
            AlertStatus::Sent => "SENT",
            AlertStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SENT" => AlertStatus::Sent,
            "FAILED" => AlertStatus::Failed,
            _ => AlertStatus::Pending,
        }
    }
}

/// Append-only audit record for a claimed event.
#[derive(Debug, Clone, Serialize)]
pub struct DedupRecord {
    pub identity: EventIdentity,
    pub alert_status: AlertStatus,
    pub failure_reason: Option<String>,
    pub reclaims: u32,
    pub claimed_at: String,
}
