//! Turns rewarded decisions into a line-delimited prompt/completion/reward
//! corpus for fine-tuning.

use ocd_decision_store::{DecisionSelector, DecisionStoreError, SelectionCriteria};
use ocd_decision_store::{DEFAULT_MAX_SAMPLES, DEFAULT_MIN_REWARD};
use ocd_decision_types::{
    format_corpus_timestamp, AgentType, DecisionRecord, TrainingExample, TrainingExampleMetadata,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

mod prompt;
mod stats;
mod writer;

pub use prompt::{ChatTemplatePromptFormatter, PromptFormatter};
pub use stats::ExportStats;
pub use writer::{default_corpus_path, write_training_corpus};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no rewarded training decisions found for {agent_type}")]
    EmptySelection { agent_type: AgentType },
    #[error("selected decision '{decision_id}' has no reward")]
    MissingReward { decision_id: String },
    #[error(transparent)]
    Store(#[from] DecisionStoreError),
    #[error("failed to serialize training example: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid output path: {0}")]
    InvalidOutputPath(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parameters of one export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub agent_type: AgentType,
    pub limit: usize,
    pub min_reward: f64,
    pub require_feedback: bool,
}

impl ExportRequest {
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            agent_type,
            limit: DEFAULT_MAX_SAMPLES,
            min_reward: DEFAULT_MIN_REWARD,
            require_feedback: false,
        }
    }

    fn criteria(&self) -> SelectionCriteria {
        SelectionCriteria {
            max_samples: self.limit,
            require_reward: true,
            require_feedback: self.require_feedback,
            min_reward: self.min_reward,
            ..SelectionCriteria::new(self.agent_type)
        }
    }
}

/// Exported examples in selection order, plus their summary.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingCorpus {
    pub agent_type: AgentType,
    pub examples: Vec<TrainingExample>,
    pub stats: ExportStats,
}

impl TrainingCorpus {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// One JSON object per line, every line newline-terminated.
    pub fn to_jsonl(&self) -> Result<String, ExportError> {
        let mut out = String::new();
        for example in &self.examples {
            out.push_str(&serde_json::to_string(example)?);
            out.push('\n');
        }
        Ok(out)
    }
}

pub struct TrainingSetExporter {
    selector: DecisionSelector,
    formatter: Arc<dyn PromptFormatter>,
}

impl TrainingSetExporter {
    pub fn new(selector: DecisionSelector) -> Self {
        Self {
            selector,
            formatter: Arc::new(ChatTemplatePromptFormatter),
        }
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn PromptFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// Selects rewarded decisions and converts them into training examples.
    /// Fails with [`ExportError::EmptySelection`] instead of returning an
    /// empty corpus.
    #[tracing::instrument(level = "info", skip(self), fields(agent_type = %request.agent_type))]
    pub async fn export(&self, request: &ExportRequest) -> Result<TrainingCorpus, ExportError> {
        let records = self.selector.select(&request.criteria()).await?;
        if records.is_empty() {
            return Err(ExportError::EmptySelection {
                agent_type: request.agent_type,
            });
        }

        let examples = records
            .iter()
            .map(|record| self.build_example(record))
            .collect::<Result<Vec<_>, _>>()?;
        let stats = ExportStats::from_examples(&examples);
        tracing::info!(count = stats.count, mean_reward = stats.mean_reward, "exported examples");
        Ok(TrainingCorpus {
            agent_type: request.agent_type,
            examples,
            stats,
        })
    }

    fn build_example(&self, record: &DecisionRecord) -> Result<TrainingExample, ExportError> {
        let reward = record.reward.ok_or_else(|| ExportError::MissingReward {
            decision_id: record.id.clone(),
        })?;
        Ok(TrainingExample {
            prompt: self.formatter.format_prompt(record.agent_type, &record.state),
            completion: serde_json::to_string(&record.action)?,
            reward,
            confidence: record.confidence,
            metadata: TrainingExampleMetadata {
                decision_id: record.id.clone(),
                item_id: record.item_id.clone(),
                opus_id: record.opus_id.clone(),
                user_feedback: record.user_feedback.clone(),
                reward_components: record.reward_components.clone(),
                created_at: format_corpus_timestamp(record.created_at),
            },
        })
    }
}
