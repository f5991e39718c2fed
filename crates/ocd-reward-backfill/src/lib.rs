//! Reward backfill: computes and persists missing rewards for logged
//! decisions, either directly against the store or through the remote
//! reward endpoint.

use async_trait::async_trait;
use ocd_decision_store::DecisionStoreError;
use ocd_decision_types::DecisionRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod direct;
mod remote;
mod server;
mod service;

pub use direct::DirectRewardBackfill;
pub use remote::{RemoteRewardBackfill, INTERNAL_API_KEY_HEADER, REWARD_ENDPOINT_PATH};
pub use server::{build_reward_endpoint_router, run_reward_endpoint, RewardEndpointConfig};
pub use service::{BackfillRun, RewardBackfillService};

/// Per-batch counts produced by either backfill mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub attempted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BackfillReport {
    pub fn merge(&mut self, other: BackfillReport) {
        self.attempted += other.attempted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Errors that abort a whole backfill call. Per-record persistence failures
/// are counted in [`BackfillReport::failed`] instead.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Store(#[from] DecisionStoreError),
    #[error("reward endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reward endpoint returned status {status}: {body}")]
    RemoteStatus { status: u16, body: String },
    #[error("reward endpoint returned a malformed response: {0}")]
    MalformedResponse(String),
}

impl BackfillError {
    /// Returns true when the same call may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(error) => error.is_retryable(),
            Self::Transport(error) => error.is_timeout() || error.is_connect(),
            Self::RemoteStatus { status, .. } => *status == 429 || *status >= 500,
            Self::MalformedResponse(_) => false,
        }
    }
}

/// Fills in rewards for decisions that lack one. Implementations are
/// interchangeable: the same input and store state yield the same report.
#[async_trait]
pub trait RewardBackfill: Send + Sync {
    async fn backfill(&self, decisions: &[DecisionRecord]) -> Result<BackfillReport, BackfillError>;
}

/// Where backfill computation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillMode {
    #[default]
    Direct,
    Remote,
}

impl BackfillMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for BackfillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "remote" | "api" => Ok(Self::Remote),
            other => Err(format!("unknown backfill mode '{other}'")),
        }
    }
}
