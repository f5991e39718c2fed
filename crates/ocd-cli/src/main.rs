//! `ocd-rl`: reward backfill, training export, and reward endpoint for the
//! agent decision log.

mod bootstrap_helpers;
mod cli_args;
mod cli_types;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::Cli;
use crate::commands::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).await
}
