//! Shared data types for the OCD decision log and training pipelines.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Model version recorded when an upstream agent does not report one.
pub const DEFAULT_MODEL_VERSION: &str = "v1";

/// Error returned when an agent type name is not part of the closed set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown agent type '{0}': expected one of FILER, LIBRARIAN, PRIORITIZER, STORER, RETRIEVER")]
pub struct ParseAgentTypeError(pub String);

/// Upstream agent that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    Filer,
    Librarian,
    Prioritizer,
    Storer,
    Retriever,
}

impl AgentType {
    pub const ALL: [AgentType; 5] = [
        AgentType::Filer,
        AgentType::Librarian,
        AgentType::Prioritizer,
        AgentType::Storer,
        AgentType::Retriever,
    ];

    /// Returns the upper-case wire name stored in the decision log.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filer => "FILER",
            Self::Librarian => "LIBRARIAN",
            Self::Prioritizer => "PRIORITIZER",
            Self::Storer => "STORER",
            Self::Retriever => "RETRIEVER",
        }
    }

    /// Returns the lower-case slug used in file names.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Filer => "filer",
            Self::Librarian => "librarian",
            Self::Prioritizer => "prioritizer",
            Self::Storer => "storer",
            Self::Retriever => "retriever",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = ParseAgentTypeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AgentType::ALL
            .into_iter()
            .find(|agent_type| agent_type.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| ParseAgentTypeError(value.to_string()))
    }
}

/// User reaction to a decision.
///
/// Labels outside the known set are carried verbatim so persisted rows never
/// fail to load; they score like absent feedback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UserFeedback {
    Confirmed,
    Corrected,
    Overridden,
    Ignored,
    Unrecognized(String),
}

impl UserFeedback {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::Corrected => "CORRECTED",
            Self::Overridden => "OVERRIDDEN",
            Self::Ignored => "IGNORED",
            Self::Unrecognized(raw) => raw.as_str(),
        }
    }
}

impl From<String> for UserFeedback {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CONFIRMED" => Self::Confirmed,
            "CORRECTED" => Self::Corrected,
            "OVERRIDDEN" => Self::Overridden,
            "IGNORED" => Self::Ignored,
            _ => Self::Unrecognized(value),
        }
    }
}

impl From<&str> for UserFeedback {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<UserFeedback> for String {
    fn from(value: UserFeedback) -> Self {
        match value {
            UserFeedback::Unrecognized(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for UserFeedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged act by one agent instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub id: String,
    pub agent_type: AgentType,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub action: Value,
    /// Write-once: authoritative as soon as it is set.
    #[serde(default)]
    pub reward: Option<f64>,
    #[serde(default)]
    pub reward_components: Option<Value>,
    #[serde(default)]
    pub reward_computed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub user_feedback: Option<UserFeedback>,
    #[serde(default)]
    pub user_correction: Option<Value>,
    #[serde(default)]
    pub outcome_metrics: Option<Value>,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub opus_id: Option<String>,
    #[serde(default = "default_model_version")]
    pub model_version: String,
    #[serde(default = "default_true")]
    pub is_training_data: bool,
    #[serde(default)]
    pub is_validation_data: bool,
    pub created_at: DateTime<Utc>,
}

fn default_model_version() -> String {
    DEFAULT_MODEL_VERSION.to_string()
}

fn default_true() -> bool {
    true
}

impl DecisionRecord {
    /// Creates a training-data decision with no reward or outcome signals yet.
    pub fn new(
        id: impl Into<String>,
        agent_type: AgentType,
        state: Value,
        action: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type,
            state,
            action,
            reward: None,
            reward_components: None,
            reward_computed_at: None,
            confidence: None,
            reasoning: None,
            user_feedback: None,
            user_correction: None,
            outcome_metrics: None,
            item_id: None,
            opus_id: None,
            model_version: default_model_version(),
            is_training_data: true,
            is_validation_data: false,
            created_at,
        }
    }

    pub fn has_reward(&self) -> bool {
        self.reward.is_some()
    }
}

/// Recency ordering used by every selection: newest first, ties by id.
pub fn newest_first(left: &DecisionRecord, right: &DecisionRecord) -> Ordering {
    right
        .created_at
        .cmp(&left.created_at)
        .then_with(|| left.id.cmp(&right.id))
}

/// Structured filter condition over decision records.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionPredicate {
    AgentTypeIs(AgentType),
    TrainingDataIs(bool),
    ValidationDataIs(bool),
    RewardPresent,
    RewardAbsent,
    RewardAtLeast(f64),
    FeedbackPresent,
    IdIn(Vec<String>),
}

impl DecisionPredicate {
    /// Evaluates the predicate against an in-process record.
    pub fn matches(&self, record: &DecisionRecord) -> bool {
        match self {
            Self::AgentTypeIs(agent_type) => record.agent_type == *agent_type,
            Self::TrainingDataIs(flag) => record.is_training_data == *flag,
            Self::ValidationDataIs(flag) => record.is_validation_data == *flag,
            Self::RewardPresent => record.reward.is_some(),
            Self::RewardAbsent => record.reward.is_none(),
            Self::RewardAtLeast(threshold) => {
                record.reward.is_some_and(|reward| reward >= *threshold)
            }
            Self::FeedbackPresent => record.user_feedback.is_some(),
            Self::IdIn(ids) => ids.iter().any(|id| id == &record.id),
        }
    }
}

/// Conjunction of predicates, ordered newest first and optionally limited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionQuery {
    pub predicates: Vec<DecisionPredicate>,
    pub limit: Option<usize>,
}

impl DecisionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate to the conjunction.
    pub fn filter(mut self, predicate: DecisionPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &DecisionRecord) -> bool {
        self.predicates
            .iter()
            .all(|predicate| predicate.matches(record))
    }
}

/// Audit trail carried by each training example back to its decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingExampleMetadata {
    pub decision_id: String,
    pub item_id: Option<String>,
    pub opus_id: Option<String>,
    pub user_feedback: Option<UserFeedback>,
    pub reward_components: Option<Value>,
    pub created_at: String,
}

/// Prompt/completion/reward example derived from a decision record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub prompt: String,
    pub completion: String,
    pub reward: f64,
    pub confidence: Option<f64>,
    pub metadata: TrainingExampleMetadata,
}

/// Renders timestamps the way the training corpus records them.
pub fn format_corpus_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
