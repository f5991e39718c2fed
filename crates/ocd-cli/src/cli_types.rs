use clap::ValueEnum;

use ocd_decision_types::AgentType;
use ocd_reward_backfill::BackfillMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliAgentType {
    Filer,
    Librarian,
    Prioritizer,
    Storer,
    Retriever,
}

impl From<CliAgentType> for AgentType {
    fn from(value: CliAgentType) -> Self {
        match value {
            CliAgentType::Filer => AgentType::Filer,
            CliAgentType::Librarian => AgentType::Librarian,
            CliAgentType::Prioritizer => AgentType::Prioritizer,
            CliAgentType::Storer => AgentType::Storer,
            CliAgentType::Retriever => AgentType::Retriever,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliBackfillMode {
    Direct,
    #[value(alias = "api")]
    Remote,
}

impl From<CliBackfillMode> for BackfillMode {
    fn from(value: CliBackfillMode) -> Self {
        match value {
            CliBackfillMode::Direct => BackfillMode::Direct,
            CliBackfillMode::Remote => BackfillMode::Remote,
        }
    }
}
