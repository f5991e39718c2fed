use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ocd_decision_store::{
    with_store_timeout, DecisionSelector, DecisionStore, SqliteDecisionStore, TrainingDataStats,
};
use ocd_decision_types::{AgentType, DecisionRecord};
use ocd_reward::{RewardCalculator, WeightedRewardCalculator};
use ocd_reward_backfill::{
    run_reward_endpoint, BackfillMode, BackfillRun, DirectRewardBackfill, RemoteRewardBackfill,
    RewardBackfill, RewardBackfillService, RewardEndpointConfig,
};
use ocd_training_export::{
    default_corpus_path, write_training_corpus, ExportRequest, ExportStats, TrainingSetExporter,
};
use serde_json::json;

use crate::cli_args::{BackfillArgs, Cli, CliCommand, ExportArgs, ImportArgs, ServeArgs, StatsArgs};
use crate::config::OcdConfig;

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let config = OcdConfig::from_cli(&cli)?;
    match cli.command {
        CliCommand::Backfill(args) => run_backfill(&config, &args).await.map(|_| ()),
        CliCommand::Export(args) => run_export(&config, &args, Utc::now()).await.map(|_| ()),
        CliCommand::Stats(args) => run_stats(&config, &args).await.map(|_| ()),
        CliCommand::Serve(args) => run_serve(&config, &args).await,
        CliCommand::Import(args) => run_import(&config, &args).await.map(|_| ()),
    }
}

fn open_store(config: &OcdConfig) -> Result<Arc<SqliteDecisionStore>> {
    let store = SqliteDecisionStore::new(&config.database_path).with_context(|| {
        format!(
            "failed to open decision store '{}'",
            config.database_path.display()
        )
    })?;
    Ok(Arc::new(store))
}

fn build_calculator(config: &OcdConfig) -> Result<Arc<dyn RewardCalculator>> {
    Ok(Arc::new(WeightedRewardCalculator::new(
        config.load_weight_schema()?,
    )))
}

pub(crate) async fn run_backfill(config: &OcdConfig, args: &BackfillArgs) -> Result<BackfillRun> {
    let agent_type = AgentType::from(args.agent_type);
    let mode = BackfillMode::from(args.mode);
    let store = open_store(config)?;
    let selector = DecisionSelector::new(store.clone()).with_timeout(config.store_timeout);

    let backfill: Arc<dyn RewardBackfill> = match mode {
        BackfillMode::Direct => Arc::new(
            DirectRewardBackfill::new(store, build_calculator(config)?)
                .with_write_timeout(config.store_timeout),
        ),
        BackfillMode::Remote => Arc::new(
            RemoteRewardBackfill::new(
                &args.remote_url,
                args.api_key.clone(),
                config.request_timeout,
            )
            .context("failed to construct reward endpoint client")?,
        ),
    };

    println!("Calculating rewards for {agent_type} decisions ({mode} mode)");
    let run = RewardBackfillService::new(selector, backfill)
        .run(agent_type, args.max_samples)
        .await
        .with_context(|| format!("reward backfill for {agent_type} failed"))?;

    println!("Found {} decisions", run.selected);
    println!("Decisions without rewards: {}", run.pending);
    if run.pending == 0 {
        println!("All decisions already have rewards");
        return Ok(run);
    }
    println!(
        "Updated {} rewards ({} skipped, {} failed)",
        run.report.updated, run.report.skipped, run.report.failed
    );
    if run.report.failed > 0 {
        bail!(
            "{} rewards could not be persisted; re-run backfill to retry",
            run.report.failed
        );
    }
    Ok(run)
}

pub(crate) async fn run_export(
    config: &OcdConfig,
    args: &ExportArgs,
    now: DateTime<Utc>,
) -> Result<(PathBuf, ExportStats)> {
    let agent_type = AgentType::from(args.agent_type);
    let store = open_store(config)?;
    let exporter =
        TrainingSetExporter::new(DecisionSelector::new(store).with_timeout(config.store_timeout));
    let request = ExportRequest {
        limit: args.limit,
        min_reward: args.min_reward,
        require_feedback: args.require_feedback,
        ..ExportRequest::new(agent_type)
    };

    let corpus = exporter
        .export(&request)
        .await
        .with_context(|| format!("training export for {agent_type} failed"))?;
    let path = args
        .output
        .clone()
        .unwrap_or_else(|| default_corpus_path(&args.output_dir, agent_type, now));
    write_training_corpus(&path, &corpus)
        .with_context(|| format!("failed to write training corpus '{}'", path.display()))?;

    let stats = corpus.stats.clone();
    println!("Exported {} examples to {}", stats.count, path.display());
    println!("Average reward: {:.3}", stats.mean_reward);
    println!(
        "Reward range: [{:.3}, {:.3}]",
        stats.min_reward, stats.max_reward
    );
    println!(
        "Confirmed: {} ({:.1}%)",
        stats.confirmed,
        stats.confirmed_pct()
    );
    println!(
        "Corrected: {} ({:.1}%)",
        stats.corrected,
        stats.corrected_pct()
    );
    println!("Ignored: {} ({:.1}%)", stats.ignored, stats.ignored_pct());
    Ok((path, stats))
}

pub(crate) async fn run_stats(config: &OcdConfig, args: &StatsArgs) -> Result<TrainingDataStats> {
    let agent_type = AgentType::from(args.agent_type);
    let store = open_store(config)?;
    let stats = with_store_timeout(
        "stats",
        config.store_timeout,
        store.training_stats(agent_type),
    )
    .await
    .with_context(|| format!("failed to load statistics for {agent_type}"))?;

    if args.json {
        let payload = json!({
            "stats": &stats,
            "readyForTraining": stats.ready_for_training(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(stats);
    }

    println!("Decision statistics for {agent_type}");
    println!("  total decisions:       {}", stats.total_decisions);
    println!("  with reward:           {}", stats.decisions_with_reward);
    println!("  with feedback:         {}", stats.decisions_with_feedback);
    println!(
        "  training / validation: {} / {}",
        stats.training_data_count, stats.validation_data_count
    );
    match (stats.avg_reward, stats.min_reward, stats.max_reward) {
        (Some(avg), Some(min), Some(max)) => {
            println!("  reward avg [min, max]: {avg:.3} [{min:.3}, {max:.3}]");
        }
        _ => println!("  reward avg [min, max]: n/a"),
    }
    println!("  ready for training:    {}", stats.ready_for_training());
    Ok(stats)
}

async fn run_serve(config: &OcdConfig, args: &ServeArgs) -> Result<()> {
    let store = open_store(config)?;
    let endpoint = RewardEndpointConfig {
        bind: args.bind.clone(),
        api_key: args.api_key.clone(),
        store_timeout: config.store_timeout,
    };
    println!("reward endpoint starting: bind={}", endpoint.bind);
    run_reward_endpoint(endpoint, store, build_calculator(config)?).await
}

pub(crate) async fn run_import(config: &OcdConfig, args: &ImportArgs) -> Result<usize> {
    let raw = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("failed to read decisions '{}'", args.input.display()))?;

    let mut records = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: DecisionRecord = serde_json::from_str(line).with_context(|| {
            format!(
                "invalid decision record on line {} of '{}'",
                index + 1,
                args.input.display()
            )
        })?;
        records.push(record);
    }

    let store = open_store(config)?;
    let imported = with_store_timeout(
        "import",
        config.store_timeout,
        store.insert_decisions(records),
    )
    .await
    .context("failed to import decisions")?;
    println!("Imported {imported} decisions");
    Ok(imported)
}
