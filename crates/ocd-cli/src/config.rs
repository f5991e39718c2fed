use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ocd_reward::WeightSchema;

use crate::cli_args::Cli;

/// Process configuration resolved once from flags and environment.
#[derive(Debug, Clone, PartialEq)]
pub struct OcdConfig {
    pub database_path: PathBuf,
    pub weights_path: Option<PathBuf>,
    pub store_timeout: Duration,
    pub request_timeout: Duration,
}

impl OcdConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let Some(database_path) = cli
            .database
            .clone()
            .filter(|path| !path.as_os_str().is_empty())
        else {
            bail!(
                "missing store connection configuration: pass --database or set OCD_DATABASE_PATH"
            );
        };

        Ok(Self {
            database_path,
            weights_path: cli.weights.clone(),
            store_timeout: Duration::from_millis(cli.store_timeout_ms),
            request_timeout: Duration::from_millis(cli.request_timeout_ms),
        })
    }

    /// Loads the configured weight schema, or the built-in one.
    pub fn load_weight_schema(&self) -> Result<Arc<WeightSchema>> {
        let Some(path) = &self.weights_path else {
            return Ok(WeightSchema::canonical());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read weight schema '{}'", path.display()))?;
        let schema = WeightSchema::from_json_str(&raw)
            .with_context(|| format!("invalid weight schema '{}'", path.display()))?;
        tracing::info!(path = %path.display(), version = schema.version(), "loaded weight schema");
        Ok(Arc::new(schema))
    }
}
