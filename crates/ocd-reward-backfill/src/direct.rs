use crate::{BackfillError, BackfillReport, RewardBackfill};
use async_trait::async_trait;
use chrono::Utc;
use ocd_decision_store::{DecisionStore, RewardWriteOutcome, DEFAULT_STORE_TIMEOUT};
use ocd_decision_types::DecisionRecord;
use ocd_reward::RewardCalculator;
use std::sync::Arc;
use std::time::Duration;

/// Computes rewards in-process and writes them with a conditional update.
#[derive(Clone)]
pub struct DirectRewardBackfill {
    store: Arc<dyn DecisionStore>,
    calculator: Arc<dyn RewardCalculator>,
    write_timeout: Duration,
}

impl DirectRewardBackfill {
    pub fn new(store: Arc<dyn DecisionStore>, calculator: Arc<dyn RewardCalculator>) -> Self {
        Self {
            store,
            calculator,
            write_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}

#[async_trait]
impl RewardBackfill for DirectRewardBackfill {
    #[tracing::instrument(level = "debug", skip_all, fields(candidates = decisions.len()))]
    async fn backfill(
        &self,
        decisions: &[DecisionRecord],
    ) -> Result<BackfillReport, BackfillError> {
        let mut report = BackfillReport {
            attempted: decisions.len(),
            ..BackfillReport::default()
        };

        for record in decisions {
            if record.has_reward() {
                report.skipped += 1;
                continue;
            }

            let reward = self.calculator.compute_reward(record);
            let write = self
                .store
                .set_reward_if_absent_within(&record.id, reward, Utc::now(), self.write_timeout)
                .await;
            match write {
                Ok(RewardWriteOutcome::Written) => {
                    tracing::trace!(decision_id = %record.id, reward, "reward written");
                    report.updated += 1;
                }
                Ok(outcome) => {
                    tracing::debug!(decision_id = %record.id, ?outcome, "reward write skipped");
                    report.skipped += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        decision_id = %record.id,
                        retryable = error.is_retryable(),
                        "failed to persist reward: {error}"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
