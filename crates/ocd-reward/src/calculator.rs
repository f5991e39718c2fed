//! Deterministic reward computation with component visibility.

use crate::schema::{AgentWeights, WeightSchema};
use ocd_decision_types::{AgentType, DecisionRecord, UserFeedback};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

pub const REWARD_CLAMP_MIN: f64 = -5.0;
pub const REWARD_CLAMP_MAX: f64 = 5.0;

/// Default window used when rescaling rewards onto `[0, 1]` for training.
pub const DEFAULT_NORMALIZATION_MIN: f64 = -2.0;
pub const DEFAULT_NORMALIZATION_MAX: f64 = 2.0;

/// Contract for reward strategies applied to decision records.
pub trait RewardCalculator: Send + Sync {
    fn compute_reward(&self, record: &DecisionRecord) -> f64;
}

/// Which rule produced a reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardSource {
    Stored,
    Components,
    Feedback,
}

/// One numeric leaf of a component tree and the weight applied to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardContribution {
    pub path: String,
    pub value: f64,
    pub weight: f64,
}

impl RewardContribution {
    pub fn weighted(&self) -> f64 {
        self.weight * self.value
    }
}

/// Reward plus the intermediate values that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardBreakdown {
    pub agent_type: AgentType,
    pub source: RewardSource,
    pub raw_total: f64,
    pub reward: f64,
    /// Leaf contributions in sorted-key traversal order; empty unless
    /// `source` is `Components`.
    pub contributions: Vec<RewardContribution>,
}

/// Weighted component-sum calculator backed by a shared [`WeightSchema`].
#[derive(Debug, Clone)]
pub struct WeightedRewardCalculator {
    schema: Arc<WeightSchema>,
}

impl Default for WeightedRewardCalculator {
    fn default() -> Self {
        Self::new(WeightSchema::canonical())
    }
}

impl WeightedRewardCalculator {
    pub fn new(schema: Arc<WeightSchema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<WeightSchema> {
        &self.schema
    }

    /// Computes a reward and reports how it was derived.
    #[tracing::instrument(level = "debug", skip(self, record), fields(decision_id = %record.id))]
    pub fn explain_reward(&self, record: &DecisionRecord) -> RewardBreakdown {
        if let Some(stored) = record.reward {
            return RewardBreakdown {
                agent_type: record.agent_type,
                source: RewardSource::Stored,
                raw_total: stored,
                reward: stored,
                contributions: Vec::new(),
            };
        }

        if let Some(components) = record
            .reward_components
            .as_ref()
            .and_then(Value::as_object)
            .filter(|components| !components.is_empty())
        {
            let mut contributions = Vec::new();
            collect_contributions(
                self.schema.agent(record.agent_type),
                components,
                None,
                &mut contributions,
            );
            let raw_total: f64 = contributions.iter().map(RewardContribution::weighted).sum();
            return RewardBreakdown {
                agent_type: record.agent_type,
                source: RewardSource::Components,
                raw_total,
                reward: clamp_reward(raw_total),
                contributions,
            };
        }

        let reward = feedback_reward(record.user_feedback.as_ref());
        RewardBreakdown {
            agent_type: record.agent_type,
            source: RewardSource::Feedback,
            raw_total: reward,
            reward,
            contributions: Vec::new(),
        }
    }
}

impl RewardCalculator for WeightedRewardCalculator {
    fn compute_reward(&self, record: &DecisionRecord) -> f64 {
        self.explain_reward(record).reward
    }
}

/// Heuristic reward used when a decision has no outcome components.
pub fn feedback_reward(feedback: Option<&UserFeedback>) -> f64 {
    match feedback {
        Some(UserFeedback::Confirmed) => 1.0,
        Some(UserFeedback::Corrected) => -0.5,
        Some(UserFeedback::Overridden) => -0.8,
        Some(UserFeedback::Ignored) | Some(UserFeedback::Unrecognized(_)) | None => 0.0,
    }
}

fn collect_contributions(
    weights: Option<&AgentWeights>,
    node: &Map<String, Value>,
    prefix: Option<&str>,
    out: &mut Vec<RewardContribution>,
) {
    for (key, value) in node {
        let path = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Number(number) => {
                let Some(value) = number.as_f64().filter(|value| value.is_finite()) else {
                    continue;
                };
                let weight = weights.map(|weights| weights.weight(&path)).unwrap_or(0.0);
                out.push(RewardContribution {
                    path,
                    value,
                    weight,
                });
            }
            Value::Object(child) => collect_contributions(weights, child, Some(&path), out),
            _ => {
                tracing::trace!(path = %path, "skipping non-numeric reward component");
            }
        }
    }
}

fn clamp_reward(total: f64) -> f64 {
    if total.is_nan() {
        return 0.0;
    }
    total.clamp(REWARD_CLAMP_MIN, REWARD_CLAMP_MAX)
}

/// Error returned when a normalization window cannot rescale rewards.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    #[error("normalization window is empty: min_reward == max_reward == {0}")]
    EmptyWindow(f64),
    #[error("normalization bounds must be finite: [{min}, {max}]")]
    NonFiniteBounds { min: f64, max: f64 },
}

/// Linearly rescales `reward` from `[min_reward, max_reward]` onto `[0, 1]`.
pub fn normalize_reward(
    reward: f64,
    min_reward: f64,
    max_reward: f64,
) -> Result<f64, NormalizationError> {
    if !min_reward.is_finite() || !max_reward.is_finite() {
        return Err(NormalizationError::NonFiniteBounds {
            min: min_reward,
            max: max_reward,
        });
    }
    if min_reward == max_reward {
        return Err(NormalizationError::EmptyWindow(min_reward));
    }
    Ok((reward - min_reward) / (max_reward - min_reward))
}
