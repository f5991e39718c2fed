use crate::{BackfillError, BackfillReport, RewardBackfill};
use ocd_decision_store::{DecisionSelector, SelectionCriteria};
use ocd_decision_types::AgentType;
use serde::Serialize;
use std::sync::Arc;

/// Summary of one backfill pass over an agent's decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillRun {
    pub agent_type: AgentType,
    pub selected: usize,
    pub pending: usize,
    pub report: BackfillReport,
}

/// Selects candidates for an agent type and hands the reward-less ones to a
/// backfill mode.
#[derive(Clone)]
pub struct RewardBackfillService {
    selector: DecisionSelector,
    backfill: Arc<dyn RewardBackfill>,
}

impl RewardBackfillService {
    pub fn new(selector: DecisionSelector, backfill: Arc<dyn RewardBackfill>) -> Self {
        Self { selector, backfill }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run(
        &self,
        agent_type: AgentType,
        max_samples: usize,
    ) -> Result<BackfillRun, BackfillError> {
        let criteria = SelectionCriteria::pending_rewards(agent_type, max_samples);
        let candidates = self.selector.select(&criteria).await?;
        let pending: Vec<_> = candidates
            .iter()
            .filter(|record| !record.has_reward())
            .cloned()
            .collect();
        tracing::info!(
            selected = candidates.len(),
            pending = pending.len(),
            "loaded backfill candidates"
        );

        if pending.is_empty() {
            return Ok(BackfillRun {
                agent_type,
                selected: candidates.len(),
                pending: 0,
                report: BackfillReport::default(),
            });
        }

        let report = self.backfill.backfill(&pending).await?;
        if report.failed > 0 {
            tracing::warn!(failed = report.failed, "some rewards could not be persisted");
        }
        Ok(BackfillRun {
            agent_type,
            selected: candidates.len(),
            pending: pending.len(),
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::RewardBackfillService;
    use crate::{BackfillReport, DirectRewardBackfill, RemoteRewardBackfill};
    use crate::{build_reward_endpoint_router, RewardEndpointConfig};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use ocd_decision_store::{DecisionSelector, DecisionStore, InMemoryDecisionStore};
    use ocd_decision_types::{AgentType, DecisionRecord, UserFeedback};
    use ocd_reward::{RewardCalculator, WeightedRewardCalculator};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn decisions() -> Vec<DecisionRecord> {
        let base = Utc.with_ymd_and_hms(2025, 9, 20, 6, 0, 0).unwrap();
        let mut components = DecisionRecord::new(
            "d-components",
            AgentType::Prioritizer,
            json!({"item": {"title": "Quarterly report"}}),
            json!({"priority": "HIGH"}),
            base,
        );
        components.reward_components = Some(json!({
            "userFeedback": {"confirmed": 1},
            "timing": {"actedWithinDay": 1}
        }));
        let mut feedback = DecisionRecord::new(
            "d-feedback",
            AgentType::Prioritizer,
            json!({}),
            json!({"priority": "LOW"}),
            base + ChronoDuration::minutes(1),
        );
        feedback.user_feedback = Some(UserFeedback::Overridden);
        let mut rewarded = feedback.clone();
        rewarded.id = "d-rewarded".to_string();
        rewarded.reward = Some(3.0);
        let other_agent = DecisionRecord::new(
            "d-filer",
            AgentType::Filer,
            json!({}),
            json!({}),
            base,
        );
        vec![components, feedback, rewarded, other_agent]
    }

    async fn seeded_store() -> Arc<InMemoryDecisionStore> {
        let store = Arc::new(InMemoryDecisionStore::new());
        store.insert_decisions(decisions()).await.expect("seed");
        store
    }

    async fn rewards(store: &InMemoryDecisionStore) -> Vec<(String, Option<f64>)> {
        let mut rewards = Vec::new();
        for record in decisions() {
            let stored = store
                .get_decision(&record.id)
                .await
                .expect("get")
                .expect("row");
            rewards.push((stored.id, stored.reward));
        }
        rewards
    }

    #[tokio::test]
    async fn direct_run_is_idempotent() {
        let store = seeded_store().await;
        let calculator: Arc<dyn RewardCalculator> = Arc::new(WeightedRewardCalculator::default());
        let service = RewardBackfillService::new(
            DecisionSelector::new(store.clone()),
            Arc::new(DirectRewardBackfill::new(store.clone(), calculator)),
        );

        let first = service.run(AgentType::Prioritizer, 1000).await.expect("first");
        assert_eq!(first.selected, 3);
        assert_eq!(first.pending, 2);
        assert_eq!(first.report.updated, 2);

        let second = service.run(AgentType::Prioritizer, 1000).await.expect("second");
        assert_eq!(second.pending, 0);
        assert_eq!(second.report, BackfillReport::default());

        let filer = store
            .get_decision("d-filer")
            .await
            .expect("get")
            .expect("row");
        assert_eq!(filer.reward, None);
    }

    #[tokio::test]
    async fn direct_and_remote_modes_agree() {
        let calculator: Arc<dyn RewardCalculator> = Arc::new(WeightedRewardCalculator::default());

        let direct_store = seeded_store().await;
        let direct = RewardBackfillService::new(
            DecisionSelector::new(direct_store.clone()),
            Arc::new(DirectRewardBackfill::new(
                direct_store.clone(),
                Arc::clone(&calculator),
            )),
        );
        let direct_run = direct.run(AgentType::Prioritizer, 1000).await.expect("direct");

        let remote_store = seeded_store().await;
        let router = build_reward_endpoint_router(
            &RewardEndpointConfig::default(),
            remote_store.clone(),
            Arc::clone(&calculator),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        let remote = RewardBackfillService::new(
            DecisionSelector::new(remote_store.clone()),
            Arc::new(
                RemoteRewardBackfill::new(&format!("http://{addr}"), None, Duration::from_secs(5))
                    .expect("client"),
            ),
        );
        let remote_run = remote.run(AgentType::Prioritizer, 1000).await.expect("remote");
        server.abort();

        assert_eq!(direct_run, remote_run);
        assert_eq!(rewards(&direct_store).await, rewards(&remote_store).await);
    }
}
