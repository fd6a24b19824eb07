//! Slack incoming-webhook transport.

use super::{AlertPayload, NotifyTransport, TransportError};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Hard cap on a single webhook round trip. Exceeding it counts as a
/// transient failure for retry accounting.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SlackTransport {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackTransport {
    pub fn new(webhook_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            webhook_url,
        })
    }

    fn render(payload: &AlertPayload) -> serde_json::Value {
        let summary = payload
            .findings_summary
            .iter()
            .map(|(category, count)| format!("{category}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut lines = vec![format!(
            "*{}*\nRisk: *{}* (score {})\nBuild: {}/{} (definition {})\nFindings: {}",
            payload.title,
            payload.risk_level,
            payload.risk_score,
            payload.build_reference.source_system,
            payload.build_reference.build_id,
            payload.build_reference.definition_id,
            summary,
        )];
        for finding in &payload.top_findings {
            lines.push(format!(
                "• `{}` [{} w{}]: `{}`",
                finding.rule_id, finding.category, finding.severity_weight, finding.excerpt
            ));
        }

        json!({ "text": lines.join("\n") })
    }
}

#[async_trait]
impl NotifyTransport for SlackTransport {
    async fn send(&self, payload: &AlertPayload) -> Result<(), TransportError> {
        let body = Self::render(payload);
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                // Connect errors and timeouts are retryable.
                TransportError::Transient(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(TransportError::Transient(format!("webhook returned {status}")))
        } else {
            // 4xx other than throttling: misconfigured or invalid destination.
            Err(TransportError::Permanent(format!("webhook returned {status}")))
        }
    }
}
