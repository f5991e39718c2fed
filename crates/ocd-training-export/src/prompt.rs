use ocd_decision_types::AgentType;
use serde_json::Value;

/// Renders the prompt half of a training example from a decision's state.
pub trait PromptFormatter: Send + Sync {
    fn format_prompt(&self, agent_type: AgentType, state: &Value) -> String;
}

/// Chat-template frame around a per-agent role line and the pretty-printed state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatTemplatePromptFormatter;

impl ChatTemplatePromptFormatter {
    fn role_line(agent_type: AgentType) -> &'static str {
        match agent_type {
            AgentType::Filer => {
                "You are the Filer. Classify the incoming item with swimlane, priority, labels, and urgency."
            }
            AgentType::Librarian => {
                "You are the Librarian. Analyze the new item for conflicts, dependencies, redundancies, relations, or suggestions."
            }
            AgentType::Prioritizer => {
                "You are the Prioritizer. Select the next item to work on from the available items."
            }
            AgentType::Storer => {
                "You are the Storer. Decide how to integrate the completed item into its opus."
            }
            AgentType::Retriever => {
                "You are the Retriever. Generate the requested document or answer from the relevant opuses."
            }
        }
    }
}

impl PromptFormatter for ChatTemplatePromptFormatter {
    fn format_prompt(&self, agent_type: AgentType, state: &Value) -> String {
        let rendered_state =
            serde_json::to_string_pretty(state).unwrap_or_else(|_| state.to_string());
        format!(
            "<|system|>\n{}\n<|user|>\nState:\n{}\n<|assistant|>",
            Self::role_line(agent_type),
            rendered_state
        )
    }
}
