use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::cli_types::{CliAgentType, CliBackfillMode};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_finite_f64(value: &str) -> Result<f64, String> {
    let parsed = value
        .parse::<f64>()
        .map_err(|error| format!("failed to parse number: {error}"))?;
    if !parsed.is_finite() {
        return Err("value must be a finite number".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "ocd-rl",
    about = "Reward backfill and training-set export for the agent decision log",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "OCD_DATABASE_PATH",
        help = "Path to the SQLite decision log"
    )]
    pub database: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "OCD_WEIGHTS_PATH",
        help = "Optional JSON weight schema overriding the built-in reward weights"
    )]
    pub weights: Option<PathBuf>,

    #[arg(
        long = "store-timeout-ms",
        global = true,
        env = "OCD_STORE_TIMEOUT_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Timeout for each decision store round-trip"
    )]
    pub store_timeout_ms: u64,

    #[arg(
        long = "request-timeout-ms",
        global = true,
        env = "OCD_REQUEST_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Timeout for remote reward endpoint requests"
    )]
    pub request_timeout_ms: u64,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Compute and persist rewards for decisions that lack one.
    Backfill(BackfillArgs),
    /// Export rewarded decisions as a JSONL training corpus.
    Export(ExportArgs),
    /// Show decision log statistics for an agent type.
    Stats(StatsArgs),
    /// Serve the reward endpoint used by remote-mode backfill.
    Serve(ServeArgs),
    /// Load decision records (one JSON object per line) into the store.
    Import(ImportArgs),
}

#[derive(Debug, Args)]
pub struct BackfillArgs {
    #[arg(long = "agent-type", value_enum, ignore_case = true)]
    pub agent_type: CliAgentType,

    #[arg(
        long = "max-samples",
        default_value_t = 1_000,
        value_parser = parse_positive_usize,
        help = "Maximum number of candidate decisions to consider"
    )]
    pub max_samples: usize,

    #[arg(long, value_enum, default_value = "direct")]
    pub mode: CliBackfillMode,

    #[arg(
        long = "remote-url",
        env = "OCD_REMOTE_URL",
        default_value = "http://localhost:3000",
        help = "Base URL of the reward endpoint for remote mode"
    )]
    pub remote_url: String,

    #[arg(long = "api-key", env = "OCD_INTERNAL_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long = "agent-type", value_enum, ignore_case = true)]
    pub agent_type: CliAgentType,

    #[arg(long, help = "Output file; defaults to a timestamped file in --output-dir")]
    pub output: Option<PathBuf>,

    #[arg(long = "output-dir", default_value = "training/data")]
    pub output_dir: PathBuf,

    #[arg(long, default_value_t = 1_000, value_parser = parse_positive_usize)]
    pub limit: usize,

    #[arg(
        long = "min-reward",
        default_value_t = -2.0,
        allow_hyphen_values = true,
        value_parser = parse_finite_f64
    )]
    pub min_reward: f64,

    #[arg(long = "require-feedback", default_value_t = false)]
    pub require_feedback: bool,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long = "agent-type", value_enum, ignore_case = true)]
    pub agent_type: CliAgentType,

    #[arg(long, default_value_t = false, help = "Print statistics as JSON")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, env = "OCD_BIND", default_value = "127.0.0.1:3000")]
    pub bind: String,

    #[arg(long = "api-key", env = "OCD_INTERNAL_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    pub input: PathBuf,
}
