use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use ocd_decision_store::{DecisionSelector, DecisionStore, SqliteDecisionStore};
use ocd_decision_types::{AgentType, DecisionRecord, UserFeedback};
use ocd_reward::{RewardCalculator, WeightSchema, WeightedRewardCalculator};
use ocd_reward_backfill::{
    build_reward_endpoint_router, DirectRewardBackfill, RemoteRewardBackfill, RewardBackfill,
    RewardBackfillService, RewardEndpointConfig,
};
use ocd_training_export::{write_training_corpus, ExportRequest, TrainingSetExporter};
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::net::TcpListener;

fn filer_decisions() -> Vec<DecisionRecord> {
    let base = Utc.with_ymd_and_hms(2025, 10, 2, 9, 0, 0).unwrap();

    let mut weighted = DecisionRecord::new(
        "filer-weighted",
        AgentType::Filer,
        json!({"item": {"title": "Invoice ACME"}}),
        json!({"swimlane": "Job1", "priority": "HIGH"}),
        base,
    );
    weighted.reward_components = Some(json!({
        "immediate": {"userFeedback": 1.0},
        "delayed": {"completionSuccess": 1.0, "notes": "on time"}
    }));
    weighted.user_feedback = Some(UserFeedback::Confirmed);

    let mut saturated = DecisionRecord::new(
        "filer-saturated",
        AgentType::Filer,
        json!({"item": {"title": "Tax filing"}}),
        json!({"swimlane": "Job2", "priority": "URGENT"}),
        base + ChronoDuration::minutes(1),
    );
    saturated.reward_components = Some(json!({"immediate": {"userFeedback": 10.0}}));
    saturated.user_feedback = Some(UserFeedback::Confirmed);

    let mut corrected = DecisionRecord::new(
        "filer-corrected",
        AgentType::Filer,
        json!({"item": {"title": "Gym membership"}}),
        json!({"swimlane": "Life", "priority": "LOW"}),
        base + ChronoDuration::minutes(2),
    );
    corrected.user_feedback = Some(UserFeedback::Corrected);

    let mut held_out = DecisionRecord::new(
        "filer-validation",
        AgentType::Filer,
        json!({}),
        json!({}),
        base + ChronoDuration::minutes(3),
    );
    held_out.is_training_data = false;
    held_out.user_feedback = Some(UserFeedback::Confirmed);

    let mut penalized = DecisionRecord::new(
        "filer-penalized",
        AgentType::Filer,
        json!({}),
        json!({"swimlane": "Job1"}),
        base + ChronoDuration::minutes(4),
    );
    penalized.reward = Some(-3.5);
    penalized.user_feedback = Some(UserFeedback::Overridden);

    vec![weighted, saturated, corrected, held_out, penalized]
}

async fn sqlite_store(root: &std::path::Path) -> Arc<SqliteDecisionStore> {
    let store = Arc::new(SqliteDecisionStore::new(root.join("decisions.sqlite")).expect("open"));
    store
        .insert_decisions(filer_decisions())
        .await
        .expect("seed decisions");
    store
}

#[tokio::test]
async fn direct_backfill_then_export_produces_stored_rewards() {
    let temp = tempdir().expect("tempdir");
    let store = sqlite_store(temp.path()).await;
    let calculator: Arc<dyn RewardCalculator> = Arc::new(WeightedRewardCalculator::default());

    let service = RewardBackfillService::new(
        DecisionSelector::new(store.clone()),
        Arc::new(DirectRewardBackfill::new(store.clone(), calculator)),
    );
    let run = service.run(AgentType::Filer, 1000).await.expect("backfill");
    assert_eq!(run.selected, 4);
    assert_eq!(run.pending, 3);
    assert_eq!(run.report.updated, 3);

    let rerun = service.run(AgentType::Filer, 1000).await.expect("rerun");
    assert_eq!(rerun.report.updated, 0);

    let reward_of = |id: &'static str| {
        let store = store.clone();
        async move {
            store
                .get_decision(id)
                .await
                .expect("get")
                .expect("row")
                .reward
        }
    };
    assert_eq!(reward_of("filer-weighted").await, Some(1.5));
    assert_eq!(reward_of("filer-saturated").await, Some(5.0));
    assert_eq!(reward_of("filer-corrected").await, Some(-0.5));
    assert_eq!(reward_of("filer-validation").await, None);
    assert_eq!(reward_of("filer-penalized").await, Some(-3.5));

    let exporter = TrainingSetExporter::new(DecisionSelector::new(store.clone()));
    let corpus = exporter
        .export(&ExportRequest::new(AgentType::Filer))
        .await
        .expect("export");
    let path = temp.path().join("out").join("filer.jsonl");
    write_training_corpus(&path, &corpus).expect("write corpus");

    let lines: Vec<Value> = std::fs::read_to_string(&path)
        .expect("read corpus")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    let exported: Vec<(String, f64)> = lines
        .iter()
        .map(|line| {
            (
                line["metadata"]["decisionId"]
                    .as_str()
                    .expect("decision id")
                    .to_string(),
                line["reward"].as_f64().expect("reward"),
            )
        })
        .collect();
    assert_eq!(
        exported,
        vec![
            ("filer-corrected".to_string(), -0.5),
            ("filer-saturated".to_string(), 5.0),
            ("filer-weighted".to_string(), 1.5),
        ]
    );
    assert_eq!(lines[2]["metadata"]["createdAt"], "2025-10-02T09:00:00.000Z");
    assert_eq!(corpus.stats.confirmed, 2);
    assert_eq!(corpus.stats.corrected, 1);
}

#[tokio::test]
async fn concurrent_backfills_write_each_reward_once() {
    let temp = tempdir().expect("tempdir");
    let store = sqlite_store(temp.path()).await;
    let candidates = DecisionSelector::new(store.clone())
        .select(&ocd_decision_store::SelectionCriteria::pending_rewards(
            AgentType::Filer,
            1000,
        ))
        .await
        .expect("select");

    let make = || {
        DirectRewardBackfill::new(store.clone(), Arc::new(WeightedRewardCalculator::default()))
            .with_write_timeout(Duration::from_secs(10))
    };
    let (first, second) = (make(), make());
    let (left, right) = tokio::join!(first.backfill(&candidates), second.backfill(&candidates));
    let left = left.expect("left run");
    let right = right.expect("right run");

    assert_eq!(left.updated + right.updated, 3);
    assert_eq!(left.failed + right.failed, 0);
    assert_eq!(left.skipped + right.skipped, 5);
}

#[tokio::test]
async fn remote_mode_matches_direct_mode_over_sqlite() {
    let direct_dir = tempdir().expect("tempdir");
    let remote_dir = tempdir().expect("tempdir");
    let direct_store = sqlite_store(direct_dir.path()).await;
    let remote_store = sqlite_store(remote_dir.path()).await;
    let calculator: Arc<dyn RewardCalculator> = Arc::new(WeightedRewardCalculator::default());

    let direct = RewardBackfillService::new(
        DecisionSelector::new(direct_store.clone()),
        Arc::new(DirectRewardBackfill::new(
            direct_store.clone(),
            Arc::clone(&calculator),
        )),
    )
    .run(AgentType::Filer, 1000)
    .await
    .expect("direct run");

    let config = RewardEndpointConfig {
        api_key: Some("internal".to_string()),
        ..RewardEndpointConfig::default()
    };
    let router = build_reward_endpoint_router(&config, remote_store.clone(), calculator);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let remote = RewardBackfillService::new(
        DecisionSelector::new(remote_store.clone()),
        Arc::new(
            RemoteRewardBackfill::new(
                &format!("http://{addr}"),
                Some("internal".to_string()),
                Duration::from_secs(5),
            )
            .expect("client"),
        ),
    )
    .run(AgentType::Filer, 1000)
    .await
    .expect("remote run");
    server.abort();

    assert_eq!(direct, remote);
    for record in filer_decisions() {
        let left = direct_store
            .get_decision(&record.id)
            .await
            .expect("get")
            .expect("row");
        let right = remote_store
            .get_decision(&record.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(left.reward, right.reward, "reward mismatch for {}", record.id);
    }
}

#[tokio::test]
async fn custom_weight_schema_changes_backfilled_rewards() {
    let temp = tempdir().expect("tempdir");
    let store = sqlite_store(temp.path()).await;
    let schema = WeightSchema::from_json_str(
        r#"{"version": 2, "agents": {"FILER": {"immediate": {"userFeedback": 0.5}}}}"#,
    )
    .expect("schema");
    let calculator = Arc::new(WeightedRewardCalculator::new(Arc::new(schema)));

    RewardBackfillService::new(
        DecisionSelector::new(store.clone()),
        Arc::new(DirectRewardBackfill::new(store.clone(), calculator)),
    )
    .run(AgentType::Filer, 1000)
    .await
    .expect("backfill");

    let weighted = store
        .get_decision("filer-weighted")
        .await
        .expect("get")
        .expect("row");
    assert_eq!(weighted.reward, Some(0.5));
}
