//! Versioned per-agent weight schema for reward components.

use ocd_decision_types::AgentType;
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Version of the canonical weight tables compiled into this crate.
pub const WEIGHT_SCHEMA_VERSION: u32 = 1;

const FILER_WEIGHTS: &[(&str, f64)] = &[
    ("immediate.userFeedback", 1.0),
    ("immediate.confidenceCalibration", 0.1),
    ("delayed.completionSuccess", 0.5),
    ("delayed.blockageAvoidance", 0.3),
    ("delayed.reworkPenalty", 0.2),
    ("delayed.timeEfficiency", 0.3),
    ("strategic.goalAlignment", 0.4),
    ("strategic.opportunityCost", 0.2),
];

const LIBRARIAN_WEIGHTS: &[(&str, f64)] = &[
    ("immediate.userFeedback", 1.0),
    ("delayed.conflictPrevention", 2.0),
    ("delayed.falsePositivePenalty", 0.5),
    ("delayed.missedIssuePenalty", 2.0),
    ("delayed.dependencyAccuracy", 0.5),
];

const PRIORITIZER_WEIGHTS: &[(&str, f64)] = &[
    ("immediate.userAcceptance", 1.0),
    ("delayed.completionSuccess", 1.0),
    ("delayed.timeEfficiency", 0.5),
    ("delayed.strategicProgress", 0.8),
    ("delayed.opportunityCost", 0.3),
    ("contextual.energyAlignment", 0.2),
    ("contextual.flowMaintenance", 0.2),
];

const STORER_WEIGHTS: &[(&str, f64)] = &[
    ("immediate.userAcceptance", 1.0),
    ("immediate.editDistance", 0.5),
    ("delayed.corpusCoherence", 0.7),
    ("delayed.findability", 0.6),
    ("delayed.duplicationPenalty", 0.4),
];

const RETRIEVER_WEIGHTS: &[(&str, f64)] = &[
    ("immediate.userAcceptance", 1.0),
    ("immediate.editDistance", 0.5),
    ("accuracy.citationCorrectness", 0.8),
    ("accuracy.hallucinationPenalty", 2.0),
    ("accuracy.completeness", 0.6),
    ("quality.coherence", 0.4),
    ("quality.styleAlignment", 0.3),
];

/// Errors raised while building a weight schema from configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WeightSchemaError {
    #[error("invalid component path '{0}': segments must be non-empty")]
    InvalidPath(String),
    #[error("weight for {agent_type} path '{path}' must be a finite number, got {value}")]
    InvalidWeight {
        agent_type: AgentType,
        path: String,
        value: String,
    },
    #[error("unknown agent type '{0}' in weight schema")]
    UnknownAgentType(String),
    #[error("malformed weight schema document: {0}")]
    Malformed(String),
}

/// Validated dotted path naming a reward component, e.g. `delayed.reworkPenalty`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentPath(String);

impl ComponentPath {
    /// Parses a dotted path, rejecting empty segments.
    pub fn parse(raw: &str) -> Result<Self, WeightSchemaError> {
        if raw.is_empty() || raw.split('.').any(str::is_empty) {
            return Err(WeightSchemaError::InvalidPath(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Appends a key below this path.
    pub fn child(&self, key: &str) -> Result<Self, WeightSchemaError> {
        Self::parse(&format!("{}.{key}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ComponentPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Flattened `path -> weight` table for one agent type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentWeights {
    weights: BTreeMap<ComponentPath, f64>,
}

impl AgentWeights {
    fn from_static(entries: &[(&str, f64)]) -> Self {
        Self {
            weights: entries
                .iter()
                .map(|(path, weight)| (ComponentPath((*path).to_string()), *weight))
                .collect(),
        }
    }

    /// Returns the weight for an exact dotted path; unmapped paths weigh 0.
    pub fn weight(&self, path: &str) -> f64 {
        self.weights.get(path).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ComponentPath, f64)> {
        self.weights.iter().map(|(path, weight)| (path, *weight))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Process-wide reward weight configuration, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightSchema {
    version: u32,
    agents: BTreeMap<AgentType, AgentWeights>,
}

impl WeightSchema {
    /// Returns the shared canonical schema compiled into this crate.
    pub fn canonical() -> Arc<WeightSchema> {
        static CANONICAL: OnceLock<Arc<WeightSchema>> = OnceLock::new();
        CANONICAL
            .get_or_init(|| {
                Arc::new(WeightSchema {
                    version: WEIGHT_SCHEMA_VERSION,
                    agents: BTreeMap::from([
                        (AgentType::Filer, AgentWeights::from_static(FILER_WEIGHTS)),
                        (
                            AgentType::Librarian,
                            AgentWeights::from_static(LIBRARIAN_WEIGHTS),
                        ),
                        (
                            AgentType::Prioritizer,
                            AgentWeights::from_static(PRIORITIZER_WEIGHTS),
                        ),
                        (AgentType::Storer, AgentWeights::from_static(STORER_WEIGHTS)),
                        (
                            AgentType::Retriever,
                            AgentWeights::from_static(RETRIEVER_WEIGHTS),
                        ),
                    ]),
                })
            })
            .clone()
    }

    /// Parses a schema document shaped like
    /// `{"version": 1, "agents": {"FILER": {"immediate": {"userFeedback": 1.0}}}}`.
    pub fn from_json_str(raw: &str) -> Result<Self, WeightSchemaError> {
        let document: Value = serde_json::from_str(raw)
            .map_err(|error| WeightSchemaError::Malformed(error.to_string()))?;
        Self::from_json_value(&document)
    }

    pub fn from_json_value(document: &Value) -> Result<Self, WeightSchemaError> {
        let Some(root) = document.as_object() else {
            return Err(WeightSchemaError::Malformed(
                "document must be a JSON object".to_string(),
            ));
        };

        let version = match root.get("version") {
            None => WEIGHT_SCHEMA_VERSION,
            Some(value) => value
                .as_u64()
                .and_then(|raw| u32::try_from(raw).ok())
                .ok_or_else(|| {
                    WeightSchemaError::Malformed(format!(
                        "version must be an unsigned integer, got {value}"
                    ))
                })?,
        };

        let Some(agents_doc) = root.get("agents").and_then(Value::as_object) else {
            return Err(WeightSchemaError::Malformed(
                "missing 'agents' object".to_string(),
            ));
        };

        let mut agents = BTreeMap::new();
        for (name, tree) in agents_doc {
            let agent_type = name
                .parse::<AgentType>()
                .map_err(|_| WeightSchemaError::UnknownAgentType(name.clone()))?;
            let Some(tree) = tree.as_object() else {
                return Err(WeightSchemaError::Malformed(format!(
                    "weights for {agent_type} must be an object"
                )));
            };
            let mut weights = BTreeMap::new();
            flatten_tree(agent_type, tree, None, &mut weights)?;
            agents.insert(agent_type, AgentWeights { weights });
        }

        Ok(Self { version, agents })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn agent(&self, agent_type: AgentType) -> Option<&AgentWeights> {
        self.agents.get(&agent_type)
    }

    /// Returns the weight for `path`; absent agents and paths weigh 0.
    pub fn weight(&self, agent_type: AgentType, path: &str) -> f64 {
        self.agent(agent_type)
            .map(|weights| weights.weight(path))
            .unwrap_or(0.0)
    }
}

fn flatten_tree(
    agent_type: AgentType,
    node: &Map<String, Value>,
    prefix: Option<&ComponentPath>,
    out: &mut BTreeMap<ComponentPath, f64>,
) -> Result<(), WeightSchemaError> {
    for (key, value) in node {
        let path = match prefix {
            Some(prefix) => prefix.child(key)?,
            None => ComponentPath::parse(key)?,
        };
        match value {
            Value::Object(child) => flatten_tree(agent_type, child, Some(&path), out)?,
            Value::Number(number) => {
                let weight = number.as_f64().filter(|weight| weight.is_finite()).ok_or_else(|| {
                    WeightSchemaError::InvalidWeight {
                        agent_type,
                        path: path.to_string(),
                        value: number.to_string(),
                    }
                })?;
                out.insert(path, weight);
            }
            other => {
                return Err(WeightSchemaError::InvalidWeight {
                    agent_type,
                    path: path.to_string(),
                    value: other.to_string(),
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ComponentPath, WeightSchema, WeightSchemaError, WEIGHT_SCHEMA_VERSION};
    use ocd_decision_types::AgentType;
    use std::sync::Arc;

    #[test]
    fn canonical_schema_reproduces_filer_table() {
        let schema = WeightSchema::canonical();
        let filer = schema.agent(AgentType::Filer).expect("filer weights");
        let entries: Vec<(String, f64)> = filer
            .iter()
            .map(|(path, weight)| (path.to_string(), weight))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("delayed.blockageAvoidance".to_string(), 0.3),
                ("delayed.completionSuccess".to_string(), 0.5),
                ("delayed.reworkPenalty".to_string(), 0.2),
                ("delayed.timeEfficiency".to_string(), 0.3),
                ("immediate.confidenceCalibration".to_string(), 0.1),
                ("immediate.userFeedback".to_string(), 1.0),
                ("strategic.goalAlignment".to_string(), 0.4),
                ("strategic.opportunityCost".to_string(), 0.2),
            ]
        );
        assert_eq!(schema.version(), WEIGHT_SCHEMA_VERSION);
    }

    #[test]
    fn canonical_schema_covers_every_agent_with_valid_paths() {
        let schema = WeightSchema::canonical();
        for agent_type in AgentType::ALL {
            let weights = schema.agent(agent_type).expect("agent weights");
            assert!(!weights.is_empty());
            for (path, weight) in weights.iter() {
                assert_eq!(
                    ComponentPath::parse(path.as_str()).as_ref(),
                    Ok(path),
                    "{agent_type} {path}"
                );
                assert!(weight.is_finite());
            }
        }
        assert_eq!(
            schema.weight(AgentType::Librarian, "delayed.missedIssuePenalty"),
            2.0
        );
        assert_eq!(
            schema.weight(AgentType::Retriever, "accuracy.hallucinationPenalty"),
            2.0
        );
        assert_eq!(schema.weight(AgentType::Storer, "delayed.findability"), 0.6);
        assert_eq!(
            schema.weight(AgentType::Prioritizer, "contextual.flowMaintenance"),
            0.2
        );
    }

    #[test]
    fn canonical_schema_is_shared() {
        assert!(Arc::ptr_eq(
            &WeightSchema::canonical(),
            &WeightSchema::canonical()
        ));
    }

    #[test]
    fn unmapped_paths_weigh_zero() {
        let schema = WeightSchema::canonical();
        assert_eq!(schema.weight(AgentType::Filer, "foo.bar"), 0.0);
        assert_eq!(schema.weight(AgentType::Filer, "immediate"), 0.0);
    }

    #[test]
    fn component_path_rejects_empty_segments() {
        assert!(ComponentPath::parse("delayed.reworkPenalty").is_ok());
        for raw in ["", ".delayed", "delayed.", "delayed..rework"] {
            assert_eq!(
                ComponentPath::parse(raw),
                Err(WeightSchemaError::InvalidPath(raw.to_string()))
            );
        }
    }

    #[test]
    fn loads_nested_schema_document() {
        let schema = WeightSchema::from_json_str(
            r#"{
                "version": 2,
                "agents": {
                    "FILER": {
                        "immediate": {"userFeedback": 3.0},
                        "delayed": {"reworkPenalty": -0.5}
                    },
                    "retriever": {"quality": {"coherence": 1}}
                }
            }"#,
        )
        .expect("parse schema");

        assert_eq!(schema.version(), 2);
        assert_eq!(schema.weight(AgentType::Filer, "immediate.userFeedback"), 3.0);
        assert_eq!(schema.weight(AgentType::Filer, "delayed.reworkPenalty"), -0.5);
        assert_eq!(schema.weight(AgentType::Retriever, "quality.coherence"), 1.0);
        assert!(schema.agent(AgentType::Storer).is_none());
        assert_eq!(schema.weight(AgentType::Storer, "delayed.findability"), 0.0);
    }

    #[test]
    fn rejects_non_numeric_leaves_and_unknown_agents() {
        let error = WeightSchema::from_json_str(
            r#"{"agents": {"FILER": {"immediate": {"userFeedback": "high"}}}}"#,
        )
        .expect_err("string leaf");
        assert!(matches!(
            error,
            WeightSchemaError::InvalidWeight { ref path, .. } if path == "immediate.userFeedback"
        ));

        let error = WeightSchema::from_json_str(r#"{"agents": {"ARCHIVIST": {}}}"#)
            .expect_err("unknown agent");
        assert_eq!(
            error,
            WeightSchemaError::UnknownAgentType("ARCHIVIST".to_string())
        );

        let error = WeightSchema::from_json_str("[]").expect_err("not an object");
        assert!(matches!(error, WeightSchemaError::Malformed(_)));
    }
}
