use crate::{BackfillError, BackfillReport, RewardBackfill};
use async_trait::async_trait;
use ocd_decision_types::DecisionRecord;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const REWARD_ENDPOINT_PATH: &str = "/api/training/decisions";
pub const INTERNAL_API_KEY_HEADER: &str = "x-internal-api-key";

#[derive(Debug, Deserialize)]
struct RemoteBackfillResponse {
    updated: usize,
    #[serde(default)]
    skipped: Option<usize>,
    #[serde(default)]
    failed: Option<usize>,
}

/// Delegates reward computation to a running reward endpoint.
#[derive(Debug, Clone)]
pub struct RemoteRewardBackfill {
    client: Client,
    endpoint_url: String,
    api_key: Option<String>,
}

impl RemoteRewardBackfill {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, BackfillError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            endpoint_url: format!(
                "{}{REWARD_ENDPOINT_PATH}",
                base_url.trim().trim_end_matches('/')
            ),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }
}

#[async_trait]
impl RewardBackfill for RemoteRewardBackfill {
    #[tracing::instrument(level = "debug", skip_all, fields(candidates = decisions.len()))]
    async fn backfill(
        &self,
        decisions: &[DecisionRecord],
    ) -> Result<BackfillReport, BackfillError> {
        let pending: Vec<&str> = decisions
            .iter()
            .filter(|record| !record.has_reward())
            .map(|record| record.id.as_str())
            .collect();
        let mut report = BackfillReport {
            attempted: decisions.len(),
            skipped: decisions.len() - pending.len(),
            ..BackfillReport::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let mut request = self
            .client
            .post(self.endpoint_url.as_str())
            .json(&json!({ "decisionIds": pending }));
        if let Some(api_key) = &self.api_key {
            request = request.header(INTERNAL_API_KEY_HEADER, api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackfillError::RemoteStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: RemoteBackfillResponse = serde_json::from_str(&body)
            .map_err(|error| BackfillError::MalformedResponse(error.to_string()))?;
        let failed = parsed.failed.unwrap_or(0);
        let accounted = parsed.updated + failed;
        if accounted > pending.len() {
            return Err(BackfillError::MalformedResponse(format!(
                "endpoint accounted for {accounted} decisions but only {} were sent",
                pending.len()
            )));
        }

        report.updated = parsed.updated;
        report.failed = failed;
        report.skipped += parsed
            .skipped
            .unwrap_or(pending.len() - accounted)
            .min(pending.len() - accounted);
        tracing::debug!(updated = report.updated, "remote backfill completed");
        Ok(report)
    }
}
