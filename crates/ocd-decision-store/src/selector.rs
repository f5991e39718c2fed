use crate::{
    with_store_timeout, AgentType, DecisionPredicate, DecisionQuery, DecisionRecord,
    DecisionStore, StoreResult, DEFAULT_STORE_TIMEOUT,
};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_SAMPLES: usize = 1000;
pub const DEFAULT_MIN_REWARD: f64 = -2.0;

/// Filter for one training-data selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionCriteria {
    pub agent_type: AgentType,
    pub max_samples: usize,
    pub require_reward: bool,
    pub require_feedback: bool,
    pub min_reward: f64,
    pub is_training_data: bool,
}

impl SelectionCriteria {
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            agent_type,
            max_samples: DEFAULT_MAX_SAMPLES,
            require_reward: true,
            require_feedback: false,
            min_reward: DEFAULT_MIN_REWARD,
            is_training_data: true,
        }
    }

    /// Criteria for decisions still waiting on a reward.
    pub fn pending_rewards(agent_type: AgentType, max_samples: usize) -> Self {
        Self {
            max_samples,
            require_reward: false,
            ..Self::new(agent_type)
        }
    }

    /// Translates the criteria into a store query.
    ///
    /// The feedback requirement only applies together with the reward
    /// requirement; on its own it is ignored.
    pub fn to_query(&self) -> DecisionQuery {
        let mut query = DecisionQuery::new()
            .filter(DecisionPredicate::AgentTypeIs(self.agent_type))
            .filter(DecisionPredicate::TrainingDataIs(self.is_training_data))
            .limit(self.max_samples);
        if self.require_reward {
            query = query.filter(DecisionPredicate::RewardAtLeast(self.min_reward));
            if self.require_feedback {
                query = query.filter(DecisionPredicate::FeedbackPresent);
            }
        }
        query
    }
}

/// Read-only view over the decision log with a bounded round-trip budget.
#[derive(Clone)]
pub struct DecisionSelector {
    store: Arc<dyn DecisionStore>,
    timeout: Duration,
}

impl DecisionSelector {
    pub fn new(store: Arc<dyn DecisionStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> Arc<dyn DecisionStore> {
        Arc::clone(&self.store)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[tracing::instrument(level = "debug", skip(self), fields(agent_type = %criteria.agent_type))]
    pub async fn select(&self, criteria: &SelectionCriteria) -> StoreResult<Vec<DecisionRecord>> {
        let query = criteria.to_query();
        let records = with_store_timeout(
            "select",
            self.timeout,
            self.store.query_decisions(&query),
        )
        .await?;
        tracing::debug!(selected = records.len(), "selected decisions");
        Ok(records)
    }

    /// Loads the given ids in recency order; unknown ids are absent from the result.
    pub async fn fetch_by_ids(&self, ids: &[String]) -> StoreResult<Vec<DecisionRecord>> {
        with_store_timeout("fetch", self.timeout, self.store.get_decisions(ids)).await
    }
}

#[cfg(test)]
mod tests {
    use super::{DecisionSelector, SelectionCriteria};
    use crate::{
        AgentType, DecisionPredicate, DecisionQuery, DecisionRecord, DecisionStore,
        DecisionStoreError, InMemoryDecisionStore, RewardWriteOutcome, StoreResult,
        TrainingDataStats, UserFeedback,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn decision(id: &str, minutes: i64, reward: Option<f64>) -> DecisionRecord {
        let mut record = DecisionRecord::new(
            id,
            AgentType::Prioritizer,
            json!({}),
            json!({"priority": "LOW"}),
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(minutes),
        );
        record.reward = reward;
        record
    }

    async fn seeded_store() -> Arc<InMemoryDecisionStore> {
        let store = Arc::new(InMemoryDecisionStore::new());
        let mut with_feedback = decision("d-feedback", 1, Some(0.5));
        with_feedback.user_feedback = Some(UserFeedback::Confirmed);
        store
            .insert_decisions(vec![
                with_feedback,
                decision("d-rewarded", 2, Some(1.0)),
                decision("d-penalized", 3, Some(-2.5)),
                decision("d-pending", 4, None),
            ])
            .await
            .expect("seed");
        store
    }

    fn ids(records: &[DecisionRecord]) -> Vec<&str> {
        records.iter().map(|record| record.id.as_str()).collect()
    }

    #[test]
    fn default_criteria_match_training_defaults() {
        let criteria = SelectionCriteria::new(AgentType::Filer);
        assert_eq!(criteria.max_samples, 1000);
        assert!(criteria.require_reward);
        assert!(!criteria.require_feedback);
        assert_eq!(criteria.min_reward, -2.0);
        assert!(criteria.is_training_data);
    }

    #[test]
    fn feedback_requirement_is_coupled_to_reward_requirement() {
        let mut criteria = SelectionCriteria::new(AgentType::Filer);
        criteria.require_feedback = true;
        assert!(criteria
            .to_query()
            .predicates
            .contains(&DecisionPredicate::FeedbackPresent));

        criteria.require_reward = false;
        let query = criteria.to_query();
        assert!(!query.predicates.contains(&DecisionPredicate::FeedbackPresent));
        assert!(!query
            .predicates
            .iter()
            .any(|predicate| matches!(predicate, DecisionPredicate::RewardAtLeast(_))));
    }

    #[tokio::test]
    async fn selects_rewarded_decisions_above_threshold() {
        let selector = DecisionSelector::new(seeded_store().await);
        let records = selector
            .select(&SelectionCriteria::new(AgentType::Prioritizer))
            .await
            .expect("select");
        assert_eq!(ids(&records), vec!["d-rewarded", "d-feedback"]);

        let mut criteria = SelectionCriteria::new(AgentType::Prioritizer);
        criteria.require_feedback = true;
        let records = selector.select(&criteria).await.expect("select feedback");
        assert_eq!(ids(&records), vec!["d-feedback"]);
    }

    #[tokio::test]
    async fn selection_is_idempotent_without_writes() {
        let selector = DecisionSelector::new(seeded_store().await);
        let criteria = SelectionCriteria::pending_rewards(AgentType::Prioritizer, 10);
        let first = selector.select(&criteria).await.expect("first");
        let second = selector.select(&criteria).await.expect("second");
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[tokio::test]
    async fn fetch_by_ids_skips_unknown_ids() {
        let selector = DecisionSelector::new(seeded_store().await);
        let records = selector
            .fetch_by_ids(&["d-pending".to_string(), "ghost".to_string()])
            .await
            .expect("fetch");
        assert_eq!(ids(&records), vec!["d-pending"]);
    }

    struct StalledStore;

    #[async_trait]
    impl DecisionStore for StalledStore {
        async fn insert_decision(&self, _record: DecisionRecord) -> StoreResult<()> {
            Ok(())
        }

        async fn query_decisions(
            &self,
            _query: &DecisionQuery,
        ) -> StoreResult<Vec<DecisionRecord>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }

        async fn get_decision(&self, _id: &str) -> StoreResult<Option<DecisionRecord>> {
            Ok(None)
        }

        async fn set_reward_if_absent(
            &self,
            _id: &str,
            _reward: f64,
            _computed_at: DateTime<Utc>,
        ) -> StoreResult<RewardWriteOutcome> {
            Ok(RewardWriteOutcome::Missing)
        }

        async fn training_stats(&self, agent_type: AgentType) -> StoreResult<TrainingDataStats> {
            Ok(TrainingDataStats::from_records(agent_type, []))
        }
    }

    #[tokio::test]
    async fn slow_store_surfaces_timeout() {
        let selector =
            DecisionSelector::new(Arc::new(StalledStore)).with_timeout(Duration::from_millis(20));
        let error = selector
            .select(&SelectionCriteria::new(AgentType::Storer))
            .await
            .expect_err("timeout");
        assert!(matches!(error, DecisionStoreError::Timeout { .. }));
        assert!(error.is_retryable());
    }
}
