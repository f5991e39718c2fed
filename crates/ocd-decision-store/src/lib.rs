//! Decision log store abstractions, in-memory and SQLite backends, and the
//! decision selector used by backfill and export.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

mod selector;
mod sqlite;

pub use ocd_decision_types::{
    newest_first, AgentType, DecisionPredicate, DecisionQuery, DecisionRecord, UserFeedback,
};
pub use selector::{DecisionSelector, SelectionCriteria, DEFAULT_MAX_SAMPLES, DEFAULT_MIN_REWARD};
pub use sqlite::SqliteDecisionStore;

/// Round-trip budget applied when a caller does not supply one.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

const READY_MIN_DECISIONS: u64 = 100;
const READY_MIN_REWARDED: u64 = 50;

/// Result type for decision store operations.
pub type StoreResult<T> = Result<T, DecisionStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum DecisionStoreError {
    #[error("decision '{0}' already exists")]
    DecisionAlreadyExists(String),
    #[error("refusing to persist non-finite reward {reward} for decision '{id}'")]
    InvalidReward { id: String, reward: f64 },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error("decision store {operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("decision store worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DecisionStoreError {
    /// Returns true when retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Outcome of a conditional "set reward only if currently null" write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardWriteOutcome {
    Written,
    AlreadyRewarded,
    Missing,
}

/// Aggregate view of the decision log for one agent type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingDataStats {
    pub agent_type: AgentType,
    pub total_decisions: u64,
    pub decisions_with_reward: u64,
    pub decisions_with_feedback: u64,
    pub avg_reward: Option<f64>,
    pub min_reward: Option<f64>,
    pub max_reward: Option<f64>,
    pub training_data_count: u64,
    pub validation_data_count: u64,
}

impl TrainingDataStats {
    /// Aggregates statistics from records already filtered to `agent_type`.
    pub fn from_records<'a>(
        agent_type: AgentType,
        records: impl IntoIterator<Item = &'a DecisionRecord>,
    ) -> Self {
        let mut stats = Self {
            agent_type,
            total_decisions: 0,
            decisions_with_reward: 0,
            decisions_with_feedback: 0,
            avg_reward: None,
            min_reward: None,
            max_reward: None,
            training_data_count: 0,
            validation_data_count: 0,
        };
        let mut reward_sum = 0.0;

        for record in records {
            stats.total_decisions += 1;
            if record.user_feedback.is_some() {
                stats.decisions_with_feedback += 1;
            }
            if record.is_training_data {
                stats.training_data_count += 1;
            }
            if record.is_validation_data {
                stats.validation_data_count += 1;
            }
            if let Some(reward) = record.reward {
                stats.decisions_with_reward += 1;
                reward_sum += reward;
                stats.min_reward = Some(stats.min_reward.map_or(reward, |min| min.min(reward)));
                stats.max_reward = Some(stats.max_reward.map_or(reward, |max| max.max(reward)));
            }
        }

        if stats.decisions_with_reward > 0 {
            stats.avg_reward = Some(reward_sum / stats.decisions_with_reward as f64);
        }
        stats
    }

    /// True once the log holds enough rewarded decisions to start a run.
    pub fn ready_for_training(&self) -> bool {
        self.total_decisions >= READY_MIN_DECISIONS
            && self.decisions_with_reward >= READY_MIN_REWARDED
    }
}

/// Async store contract used by the selector, backfill, and export.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn insert_decision(&self, record: DecisionRecord) -> StoreResult<()>;
    async fn insert_decisions(&self, records: Vec<DecisionRecord>) -> StoreResult<usize> {
        let count = records.len();
        for record in records {
            self.insert_decision(record).await?;
        }
        Ok(count)
    }

    /// Returns matching records ordered newest first, ties broken by id.
    async fn query_decisions(&self, query: &DecisionQuery) -> StoreResult<Vec<DecisionRecord>>;
    async fn get_decision(&self, id: &str) -> StoreResult<Option<DecisionRecord>>;

    /// Loads the given ids newest first; unknown ids are absent from the result.
    async fn get_decisions(&self, ids: &[String]) -> StoreResult<Vec<DecisionRecord>> {
        let query = DecisionQuery::new().filter(DecisionPredicate::IdIn(ids.to_vec()));
        self.query_decisions(&query).await
    }

    /// Atomically sets `reward` and its computed-at timestamp if the record
    /// has no reward yet.
    async fn set_reward_if_absent(
        &self,
        id: &str,
        reward: f64,
        computed_at: DateTime<Utc>,
    ) -> StoreResult<RewardWriteOutcome>;

    /// Conditional reward write bounded by `timeout`. An error means the
    /// reward was not persisted by this call.
    async fn set_reward_if_absent_within(
        &self,
        id: &str,
        reward: f64,
        computed_at: DateTime<Utc>,
        timeout: Duration,
    ) -> StoreResult<RewardWriteOutcome> {
        with_store_timeout(
            "set_reward",
            timeout,
            self.set_reward_if_absent(id, reward, computed_at),
        )
        .await
    }

    async fn training_stats(&self, agent_type: AgentType) -> StoreResult<TrainingDataStats>;
}

/// Bounds a store round-trip; elapsed budgets surface as retryable timeouts.
pub async fn with_store_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    future: F,
) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(DecisionStoreError::Timeout {
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryDecisionStore {
    decisions: RwLock<HashMap<String, DecisionRecord>>,
}

impl InMemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DecisionStore for InMemoryDecisionStore {
    async fn insert_decision(&self, record: DecisionRecord) -> StoreResult<()> {
        let mut decisions = self.decisions.write().await;
        if decisions.contains_key(&record.id) {
            return Err(DecisionStoreError::DecisionAlreadyExists(record.id));
        }
        decisions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn query_decisions(&self, query: &DecisionQuery) -> StoreResult<Vec<DecisionRecord>> {
        let decisions = self.decisions.read().await;
        let mut matched: Vec<DecisionRecord> = decisions
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        drop(decisions);

        matched.sort_by(newest_first);
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn get_decision(&self, id: &str) -> StoreResult<Option<DecisionRecord>> {
        Ok(self.decisions.read().await.get(id).cloned())
    }

    async fn set_reward_if_absent(
        &self,
        id: &str,
        reward: f64,
        computed_at: DateTime<Utc>,
    ) -> StoreResult<RewardWriteOutcome> {
        if !reward.is_finite() {
            return Err(DecisionStoreError::InvalidReward {
                id: id.to_string(),
                reward,
            });
        }

        let mut decisions = self.decisions.write().await;
        let Some(record) = decisions.get_mut(id) else {
            return Ok(RewardWriteOutcome::Missing);
        };
        if record.reward.is_some() {
            return Ok(RewardWriteOutcome::AlreadyRewarded);
        }
        record.reward = Some(reward);
        record.reward_computed_at = Some(computed_at);
        Ok(RewardWriteOutcome::Written)
    }

    async fn training_stats(&self, agent_type: AgentType) -> StoreResult<TrainingDataStats> {
        let decisions = self.decisions.read().await;
        Ok(TrainingDataStats::from_records(
            agent_type,
            decisions
                .values()
                .filter(|record| record.agent_type == agent_type),
        ))
    }
}
