//! Alert dispatcher -- bounded retry around the notification transport.

use super::{AlertPayload, NotifyTransport, TransportError};
use crate::dedup::{DedupStore, EventIdentity};
use crate::scan::ArtifactScanResult;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Transport attempts per alert, including the first.
const MAX_ATTEMPTS: u32 = 3;
/// Backoff before attempt N+1: 1s, 4s, 16s (truncated by MAX_ATTEMPTS).
const BACKOFF_SECS: [u64; 3] = [1, 4, 16];

/// Outcome of a dispatch, mirrored into the dedup record.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Failed,
    /// Shutdown aborted the backoff wait; the record stays PENDING and the
    /// recovery sweep picks it up.
    Aborted,
}

pub struct Dispatcher {
    transport: Arc<dyn NotifyTransport>,
    dedup: DedupStore,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn NotifyTransport>,
        dedup: DedupStore,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            dedup,
            shutdown,
        }
    }

    /// Format and send the alert for a freshly claimed event.
    ///
    /// Only called after a successful claim. Transient transport failures are
    /// retried with exponential backoff; permanent ones fail immediately. On
    /// exhaustion the dedup record transitions to FAILED and remains
    /// inspectable for manual replay -- the finding data is never dropped.
    pub async fn dispatch(
        &self,
        result: &ArtifactScanResult,
        identity: &EventIdentity,
    ) -> Result<DispatchOutcome> {
        let payload = AlertPayload::from_result(result, identity);
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.transport.send(&payload).await {
                Ok(()) => {
                    self.dedup.mark_sent(identity)?;
                    info!(event = %identity, attempt, "Alert dispatched");
                    return Ok(DispatchOutcome::Sent);
                }
                Err(TransportError::Permanent(reason)) => {
                    error!(event = %identity, %reason, "Permanent transport failure, not retrying");
                    self.dedup.mark_failed(identity, &reason)?;
                    return Ok(DispatchOutcome::Failed);
                }
                Err(TransportError::Transient(reason)) => {
                    warn!(event = %identity, attempt, %reason, "Transient transport failure");
                    last_error = reason;
                }
            }

            if attempt < MAX_ATTEMPTS {
                let wait = Duration::from_secs(BACKOFF_SECS[(attempt - 1) as usize]);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.shutdown.cancelled() => {
                        // Leave the record PENDING; the recovery sweep
                        // re-claims it after restart.
                        warn!(event = %identity, "Dispatch aborted by shutdown during backoff");
                        return Ok(DispatchOutcome::Aborted);
                    }
                }
            }
        }

        let reason = format!("retries exhausted after {MAX_ATTEMPTS} attempts: {last_error}");
        error!(event = %identity, %reason, "Alert dispatch failed");
        self.dedup.mark_failed(identity, &reason)?;
        Ok(DispatchOutcome::Failed)
    }
}
