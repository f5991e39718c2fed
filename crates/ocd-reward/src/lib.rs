//! Reward computation for logged agent decisions.
//!
//! A decision's scalar reward comes from, in order of precedence: the stored
//! write-once reward, the weighted sum of its outcome components under the
//! per-agent [`WeightSchema`], or a heuristic over the user's feedback label.

mod calculator;
mod schema;

pub use calculator::{
    feedback_reward, normalize_reward, NormalizationError, RewardBreakdown, RewardCalculator,
    RewardContribution, RewardSource, WeightedRewardCalculator, DEFAULT_NORMALIZATION_MAX,
    DEFAULT_NORMALIZATION_MIN, REWARD_CLAMP_MAX, REWARD_CLAMP_MIN,
};
pub use schema::{
    AgentWeights, ComponentPath, WeightSchema, WeightSchemaError, WEIGHT_SCHEMA_VERSION,
};
