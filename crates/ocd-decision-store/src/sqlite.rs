//! SQLite-backed `DecisionStore` implementation with durable persistence.

use crate::{
    newest_first, AgentType, DecisionPredicate, DecisionQuery, DecisionRecord, DecisionStore,
    DecisionStoreError, RewardWriteOutcome, StoreResult, TrainingDataStats, UserFeedback,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
// Well under SQLITE_MAX_VARIABLE_NUMBER, leaving room for the other predicates.
const MAX_BOUND_IDS: usize = 500;

const DECISION_COLUMNS: &str = r#"
    id, agent_type, state_json, action_json, reward, reward_components_json,
    reward_computed_at, confidence, reasoning, user_feedback, user_correction_json,
    outcome_metrics_json, item_id, opus_id, model_version, is_training_data,
    is_validation_data, created_at
"#;

/// Persistent SQLite decision log.
#[derive(Debug, Clone)]
pub struct SqliteDecisionStore {
    db_path: PathBuf,
}

impl SqliteDecisionStore {
    /// Opens (or creates) the decision log at `path` and ensures its schema.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = open_connection(&store.db_path, BUSY_TIMEOUT)?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn with_connection<T, F>(&self, operation: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        self.with_bounded_connection(BUSY_TIMEOUT, operation).await
    }

    /// Runs `operation` on a blocking worker whose lock waits give up after
    /// `busy_timeout`, so the worker finishes instead of outliving its caller.
    async fn with_bounded_connection<T, F>(
        &self,
        busy_timeout: Duration,
        operation: F,
    ) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = open_connection(&db_path, busy_timeout)?;
            operation(&mut connection)
        })
        .await
        .map_err(|error| DecisionStoreError::Worker(error.to_string()))?
    }
}

fn open_connection(db_path: &Path, busy_timeout: Duration) -> StoreResult<Connection> {
    let connection = Connection::open(db_path)?;
    connection.busy_timeout(busy_timeout)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> StoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS decisions (
            id TEXT PRIMARY KEY,
            agent_type TEXT NOT NULL,
            state_json TEXT NOT NULL,
            action_json TEXT NOT NULL,
            reward REAL NULL,
            reward_components_json TEXT NULL,
            reward_computed_at TEXT NULL,
            confidence REAL NULL,
            reasoning TEXT NULL,
            user_feedback TEXT NULL,
            user_correction_json TEXT NULL,
            outcome_metrics_json TEXT NULL,
            item_id TEXT NULL,
            opus_id TEXT NULL,
            model_version TEXT NOT NULL,
            is_training_data INTEGER NOT NULL,
            is_validation_data INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_decisions_selection
            ON decisions (agent_type, is_training_data, created_at DESC);

        CREATE INDEX IF NOT EXISTS idx_decisions_pending_reward
            ON decisions (agent_type, reward);
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl DecisionStore for SqliteDecisionStore {
    async fn insert_decision(&self, record: DecisionRecord) -> StoreResult<()> {
        self.with_connection(move |connection| insert_record(connection, &record))
            .await
    }

    async fn insert_decisions(&self, records: Vec<DecisionRecord>) -> StoreResult<usize> {
        self.with_connection(move |connection| {
            let transaction = connection.transaction()?;
            for record in &records {
                insert_record(&transaction, record)?;
            }
            transaction.commit()?;
            Ok(records.len())
        })
        .await
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, query),
        fields(predicates = query.predicates.len())
    )]
    async fn query_decisions(&self, query: &DecisionQuery) -> StoreResult<Vec<DecisionRecord>> {
        let statements: Vec<(String, Vec<SqlValue>)> =
            split_id_lookups(query).iter().map(build_select).collect();
        let chunked = statements.len() > 1;
        let limit = query.limit;
        self.with_connection(move |connection| {
            let mut decisions = Vec::new();
            for (sql, bound) in &statements {
                let mut statement = connection.prepare(sql)?;
                let mut rows = statement.query(params_from_iter(bound.iter()))?;
                while let Some(row) = rows.next()? {
                    decisions.push(record_from_row(row)?);
                }
            }
            if chunked {
                decisions.sort_by(newest_first);
                if let Some(limit) = limit {
                    decisions.truncate(limit);
                }
            }
            Ok(decisions)
        })
        .await
    }

    async fn get_decision(&self, id: &str) -> StoreResult<Option<DecisionRecord>> {
        let id = id.to_string();
        self.with_connection(move |connection| {
            let sql = format!("SELECT {DECISION_COLUMNS} FROM decisions WHERE id = ?1");
            let mut statement = connection.prepare(&sql)?;
            let mut rows = statement.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(record_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set_reward_if_absent(
        &self,
        id: &str,
        reward: f64,
        computed_at: DateTime<Utc>,
    ) -> StoreResult<RewardWriteOutcome> {
        self.set_reward_if_absent_within(id, reward, computed_at, BUSY_TIMEOUT).await
    }

    async fn set_reward_if_absent_within(
        &self,
        id: &str,
        reward: f64,
        computed_at: DateTime<Utc>,
        timeout: Duration,
    ) -> StoreResult<RewardWriteOutcome> {
        if !reward.is_finite() {
            return Err(DecisionStoreError::InvalidReward {
                id: id.to_string(),
                reward,
            });
        }

        let id = id.to_string();
        self.with_bounded_connection(timeout.min(BUSY_TIMEOUT), move |connection| {
            write_reward(connection, &id, reward, computed_at)
        })
        .await
    }

    async fn training_stats(&self, agent_type: AgentType) -> StoreResult<TrainingDataStats> {
        self.with_connection(move |connection| {
            connection
                .query_row(
                    r#"
                    SELECT
                        COUNT(*),
                        COUNT(reward),
                        COALESCE(SUM(CASE WHEN user_feedback IS NOT NULL THEN 1 ELSE 0 END), 0),
                        AVG(reward),
                        MIN(reward),
                        MAX(reward),
                        COALESCE(SUM(is_training_data), 0),
                        COALESCE(SUM(is_validation_data), 0)
                    FROM decisions
                    WHERE agent_type = ?1
                    "#,
                    params![agent_type.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Option<f64>>(3)?,
                            row.get::<_, Option<f64>>(4)?,
                            row.get::<_, Option<f64>>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                        ))
                    },
                )
                .map_err(DecisionStoreError::from)
                .and_then(
                    |(total, rewarded, with_feedback, avg, min, max, training, validation)| {
                        Ok(TrainingDataStats {
                            agent_type,
                            total_decisions: i64_to_u64("total_decisions", total)?,
                            decisions_with_reward: i64_to_u64("decisions_with_reward", rewarded)?,
                            decisions_with_feedback: i64_to_u64(
                                "decisions_with_feedback",
                                with_feedback,
                            )?,
                            avg_reward: avg,
                            min_reward: min,
                            max_reward: max,
                            training_data_count: i64_to_u64("training_data_count", training)?,
                            validation_data_count: i64_to_u64(
                                "validation_data_count",
                                validation,
                            )?,
                        })
                    },
                )
        })
        .await
    }
}

fn write_reward(
    connection: &Connection,
    id: &str,
    reward: f64,
    computed_at: DateTime<Utc>,
) -> StoreResult<RewardWriteOutcome> {
    let changed = connection.execute(
        r#"
        UPDATE decisions
        SET reward = ?1, reward_computed_at = ?2
        WHERE id = ?3 AND reward IS NULL
        "#,
        params![reward, timestamp_to_db(computed_at), id],
    )?;
    if changed > 0 {
        return Ok(RewardWriteOutcome::Written);
    }

    let exists = connection
        .query_row("SELECT 1 FROM decisions WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(if exists {
        RewardWriteOutcome::AlreadyRewarded
    } else {
        RewardWriteOutcome::Missing
    })
}

fn insert_record(connection: &Connection, record: &DecisionRecord) -> StoreResult<()> {
    let exists = connection
        .query_row(
            "SELECT 1 FROM decisions WHERE id = ?1",
            params![record.id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if exists {
        return Err(DecisionStoreError::DecisionAlreadyExists(record.id.clone()));
    }

    connection.execute(
        &format!(
            "INSERT INTO decisions ({DECISION_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
        ),
        params![
            record.id,
            record.agent_type.as_str(),
            serialize_json(&record.state)?,
            serialize_json(&record.action)?,
            record.reward,
            option_json_to_db(record.reward_components.as_ref())?,
            record.reward_computed_at.map(timestamp_to_db),
            record.confidence,
            record.reasoning,
            record.user_feedback.as_ref().map(UserFeedback::as_str),
            option_json_to_db(record.user_correction.as_ref())?,
            option_json_to_db(record.outcome_metrics.as_ref())?,
            record.item_id,
            record.opus_id,
            record.model_version,
            record.is_training_data,
            record.is_validation_data,
            timestamp_to_db(record.created_at),
        ],
    )?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> StoreResult<DecisionRecord> {
    Ok(DecisionRecord {
        id: row.get(0)?,
        agent_type: agent_type_from_db(&row.get::<_, String>(1)?)?,
        state: deserialize_json::<Value>(&row.get::<_, String>(2)?)?,
        action: deserialize_json::<Value>(&row.get::<_, String>(3)?)?,
        reward: row.get(4)?,
        reward_components: option_json_from_db(row.get(5)?)?,
        reward_computed_at: option_timestamp_from_db(row.get(6)?)?,
        confidence: row.get(7)?,
        reasoning: row.get(8)?,
        user_feedback: row.get::<_, Option<String>>(9)?.map(UserFeedback::from),
        user_correction: option_json_from_db(row.get(10)?)?,
        outcome_metrics: option_json_from_db(row.get(11)?)?,
        item_id: row.get(12)?,
        opus_id: row.get(13)?,
        model_version: row.get(14)?,
        is_training_data: row.get(15)?,
        is_validation_data: row.get(16)?,
        created_at: timestamp_from_db(&row.get::<_, String>(17)?)?,
    })
}

/// Splits oversized id lists into disjoint chunks so no statement exceeds
/// SQLite's bound-variable limit. Each chunk keeps the caller's limit.
pub(crate) fn split_id_lookups(query: &DecisionQuery) -> Vec<DecisionQuery> {
    let oversized = query
        .predicates
        .iter()
        .enumerate()
        .find_map(|(index, predicate)| match predicate {
            DecisionPredicate::IdIn(ids) if ids.len() > MAX_BOUND_IDS => Some((index, ids)),
            _ => None,
        });
    let Some((index, ids)) = oversized else {
        return vec![query.clone()];
    };

    let mut seen = HashSet::new();
    let unique: Vec<String> = ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();
    unique
        .chunks(MAX_BOUND_IDS)
        .flat_map(|chunk| {
            let mut part = query.clone();
            part.predicates[index] = DecisionPredicate::IdIn(chunk.to_vec());
            split_id_lookups(&part)
        })
        .collect()
}

/// Builds a fully parameterized SELECT for `query`. Caller-supplied values
/// only ever reach SQLite as bound parameters.
pub(crate) fn build_select(query: &DecisionQuery) -> (String, Vec<SqlValue>) {
    let mut bound = Vec::new();
    let clauses: Vec<String> = query
        .predicates
        .iter()
        .map(|predicate| predicate_clause(predicate, &mut bound))
        .collect();

    let mut sql = format!("SELECT {DECISION_COLUMNS} FROM decisions");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, id ASC");
    if let Some(limit) = query.limit {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let placeholder = bind(&mut bound, SqlValue::Integer(limit));
        sql.push_str(&format!(" LIMIT {placeholder}"));
    }
    (sql, bound)
}

fn bind(bound: &mut Vec<SqlValue>, value: SqlValue) -> String {
    bound.push(value);
    format!("?{}", bound.len())
}

fn predicate_clause(predicate: &DecisionPredicate, bound: &mut Vec<SqlValue>) -> String {
    match predicate {
        DecisionPredicate::AgentTypeIs(agent_type) => {
            let placeholder = bind(bound, SqlValue::Text(agent_type.as_str().to_string()));
            format!("agent_type = {placeholder}")
        }
        DecisionPredicate::TrainingDataIs(flag) => {
            let placeholder = bind(bound, SqlValue::Integer(i64::from(*flag)));
            format!("is_training_data = {placeholder}")
        }
        DecisionPredicate::ValidationDataIs(flag) => {
            let placeholder = bind(bound, SqlValue::Integer(i64::from(*flag)));
            format!("is_validation_data = {placeholder}")
        }
        DecisionPredicate::RewardPresent => "reward IS NOT NULL".to_string(),
        DecisionPredicate::RewardAbsent => "reward IS NULL".to_string(),
        DecisionPredicate::RewardAtLeast(threshold) => {
            let placeholder = bind(bound, SqlValue::Real(*threshold));
            format!("(reward IS NOT NULL AND reward >= {placeholder})")
        }
        DecisionPredicate::FeedbackPresent => "user_feedback IS NOT NULL".to_string(),
        DecisionPredicate::IdIn(ids) if ids.is_empty() => "0".to_string(),
        DecisionPredicate::IdIn(ids) => {
            let placeholders: Vec<String> = ids
                .iter()
                .map(|id| bind(bound, SqlValue::Text(id.clone())))
                .collect();
            format!("id IN ({})", placeholders.join(", "))
        }
    }
}

fn serialize_json<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(DecisionStoreError::from)
}

fn deserialize_json<T: DeserializeOwned>(value: &str) -> StoreResult<T> {
    serde_json::from_str(value).map_err(DecisionStoreError::from)
}

fn option_json_to_db(value: Option<&Value>) -> StoreResult<Option<String>> {
    value.map(serialize_json).transpose()
}

fn option_json_from_db(value: Option<String>) -> StoreResult<Option<Value>> {
    value.as_deref().map(deserialize_json::<Value>).transpose()
}

// Fixed-width UTC text keeps lexicographic order equal to chronological order.
fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn agent_type_from_db(value: &str) -> StoreResult<AgentType> {
    value
        .parse::<AgentType>()
        .map_err(|_| DecisionStoreError::InvalidPersistedValue {
            field: "agent_type",
            value: value.to_string(),
        })
}

fn i64_to_u64(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| DecisionStoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
