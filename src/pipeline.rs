//! Event pipeline -- scan, score, claim, dispatch.
//!
//! One worker per inbound event; scanning and scoring are pure functions over
//! a rule-set snapshot, so workers share nothing but the claim operation.

use crate::alert::dispatcher::DispatchOutcome;
use crate::alert::Dispatcher;
use crate::dedup::{ClaimOutcome, DedupStore, EventIdentity};
use crate::rules::RuleStore;
use crate::scan::{aggregate, engine, whitelist, ArtifactKind, ArtifactScanResult, Finding};
use crate::storage::{self, Pool};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Inbound build event from the webhook/collector layer.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub source_system: String,
    pub build_id: String,
    pub definition_id: String,
    pub kind: ArtifactKind,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn identity(&self) -> EventIdentity {
        EventIdentity {
            source_system: self.source_system.clone(),
            build_id: self.build_id.clone(),
            definition_id: self.definition_id.clone(),
            content_hash: content_hash(&self.content),
        }
    }
}

/// What happened to one event. `AlreadyAlerted` and `Clean` are the quiet,
/// common outcomes.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Clean,
    AlreadyAlerted,
    Dispatched,
    DispatchFailed,
    DispatchAborted,
}

pub struct Pipeline {
    rules: Arc<RuleStore>,
    pool: Pool,
    dedup: DedupStore,
    dispatcher: Arc<Dispatcher>,
}

impl Pipeline {
    pub fn new(
        rules: Arc<RuleStore>,
        pool: Pool,
        dedup: DedupStore,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            rules,
            pool,
            dedup,
            dispatcher,
        }
    }

    /// Run one event through scan -> filter -> aggregate -> claim -> dispatch.
    ///
    /// Errors here are isolated per event; the caller logs them and moves on
    /// to sibling events in the batch.
    pub async fn process_event(&self, event: &InboundEvent) -> Result<ProcessOutcome> {
        let identity = event.identity();
        let event_id = storage::save_event(&self.pool, event, &identity.content_hash)
            .context("failed to persist inbound event")?;

        let result = self.analyze(event);
        storage::save_scan_result(&self.pool, event_id, &result)
            .context("failed to persist scan result")?;

        if result.is_clean() {
            info!(event = %identity, "Artifact clean, nothing to alert");
            return Ok(ProcessOutcome::Clean);
        }

        match self.dedup.claim(&identity)? {
            ClaimOutcome::AlreadyClaimed => {
                info!(event = %identity, "Already alerted for this build, skipping");
                return Ok(ProcessOutcome::AlreadyAlerted);
            }
            ClaimOutcome::Claimed => {}
        }

        match self.dispatcher.dispatch(&result, &identity).await? {
            DispatchOutcome::Sent => Ok(ProcessOutcome::Dispatched),
            DispatchOutcome::Failed => Ok(ProcessOutcome::DispatchFailed),
            DispatchOutcome::Aborted => Ok(ProcessOutcome::DispatchAborted),
        }
    }

    /// Pure analysis: scan the artifact's scannable blocks against the current
    /// rule-set snapshot, filter through the whitelist, aggregate the score.
    pub fn analyze(&self, event: &InboundEvent) -> ArtifactScanResult {
        let ruleset = self.rules.current();
        let artifact_id = format!("{}-{}-{}", event.kind, event.definition_id, event.build_id);

        let mut findings: Vec<Finding> = Vec::new();
        for block in engine::scannable_blocks(event.kind, &event.content) {
            // Spans come back relative to the block; shift them onto the
            // artifact's coordinates before merging.
            let offset = block.as_ptr() as usize - event.content.as_ptr() as usize;
            for mut finding in engine::scan(&ruleset, &artifact_id, block) {
                for span in &mut finding.spans {
                    span.0 += offset;
                }
                merge_finding(&mut findings, finding);
            }
        }

        let filtered = whitelist::filter(findings, &ruleset);
        let (risk_score, risk_level) = aggregate::aggregate(&filtered);

        ArtifactScanResult {
            artifact_id,
            kind: event.kind,
            script_type: engine::sniff_script_type(&event.content),
            findings: filtered,
            risk_score,
            risk_level,
        }
    }

    /// Recovery sweep: re-claim events stuck PENDING past the timeout and
    /// re-run their dispatch from the persisted findings.
    ///
    /// Failures are isolated per event: one identity that cannot be replayed
    /// is logged and the rest of the sweep continues.
    pub async fn recover_stalled(&self, timeout_secs: u64) -> Result<usize> {
        let stale = self.dedup.reclaim_stale(timeout_secs)?;
        let mut recovered = 0;

        for identity in stale {
            match self.redispatch(&identity).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => warn!(event = %identity, "Recovery redispatch failed: {e:#}"),
            }
        }
        Ok(recovered)
    }

    async fn redispatch(&self, identity: &EventIdentity) -> Result<bool> {
        match storage::load_scan_result(&self.pool, identity)? {
            Some(result) => {
                self.dispatcher.dispatch(&result, identity).await?;
                Ok(true)
            }
            None => {
                warn!(event = %identity, "Stale claim has no persisted scan result");
                self.dedup
                    .mark_failed(identity, "no persisted scan result for replay")?;
                Ok(false)
            }
        }
    }
}

/// Merge a block-level finding into the artifact-level set: same rule across
/// blocks stays one finding with the union of spans.
fn merge_finding(findings: &mut Vec<Finding>, finding: Finding) {
    match findings.iter_mut().find(|f| f.rule_id == finding.rule_id) {
        Some(existing) => existing.spans.extend(finding.spans),
        None => findings.push(finding),
    }
}

fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
