//! HTTP reward endpoint used by remote-mode backfill.

use crate::remote::{INTERNAL_API_KEY_HEADER, REWARD_ENDPOINT_PATH};
use crate::{BackfillError, DirectRewardBackfill, RewardBackfill};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ocd_decision_store::{
    DecisionSelector, DecisionStore, DecisionStoreError, DEFAULT_STORE_TIMEOUT,
};
use ocd_reward::RewardCalculator;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const REWARD_ENDPOINT_HEALTH_PATH: &str = "/api/training/health";

#[derive(Debug, Clone)]
pub struct RewardEndpointConfig {
    pub bind: String,
    pub api_key: Option<String>,
    pub store_timeout: Duration,
}

impl Default for RewardEndpointConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            api_key: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewardEndpointRequest {
    decision_ids: Vec<String>,
}

struct RewardEndpointState {
    selector: DecisionSelector,
    backfill: DirectRewardBackfill,
    api_key: Option<String>,
}

/// Runs the reward endpoint until ctrl-c.
pub async fn run_reward_endpoint(
    config: RewardEndpointConfig,
    store: Arc<dyn DecisionStore>,
    calculator: Arc<dyn RewardCalculator>,
) -> Result<()> {
    let bind_addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid --bind '{}': expected host:port", config.bind))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind reward endpoint on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve reward endpoint listen address")?;

    tracing::info!(
        addr = %local_addr,
        authenticated = config.api_key.is_some(),
        "reward endpoint listening"
    );
    let app = build_reward_endpoint_router(&config, store, calculator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("reward endpoint exited unexpectedly")?;
    Ok(())
}

pub fn build_reward_endpoint_router(
    config: &RewardEndpointConfig,
    store: Arc<dyn DecisionStore>,
    calculator: Arc<dyn RewardCalculator>,
) -> Router {
    let state = Arc::new(RewardEndpointState {
        selector: DecisionSelector::new(Arc::clone(&store)).with_timeout(config.store_timeout),
        backfill: DirectRewardBackfill::new(store, calculator)
            .with_write_timeout(config.store_timeout),
        api_key: config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty()),
    });
    Router::new()
        .route(REWARD_ENDPOINT_HEALTH_PATH, get(handle_health))
        .route(REWARD_ENDPOINT_PATH, post(handle_backfill))
        .with_state(state)
}

async fn handle_health(State(state): State<Arc<RewardEndpointState>>) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "authenticated": state.api_key.is_some(),
        })),
    )
        .into_response()
}

async fn handle_backfill(
    State(state): State<Arc<RewardEndpointState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(expected) = &state.api_key {
        let provided = headers
            .get(INTERNAL_API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected.as_str()) {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "reward_endpoint_unauthorized",
                "missing or invalid internal api key",
            );
        }
    }

    let request: RewardEndpointRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "reward_endpoint_invalid_request",
                &format!("expected {{\"decisionIds\": [...]}}: {error}"),
            );
        }
    };

    let mut seen = BTreeSet::new();
    let ids: Vec<String> = request
        .decision_ids
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect();

    let records = match state.selector.fetch_by_ids(&ids).await {
        Ok(records) => records,
        Err(error) => return store_error_response(&error),
    };
    let mut report = match state.backfill.backfill(&records).await {
        Ok(report) => report,
        Err(BackfillError::Store(error)) => return store_error_response(&error),
        Err(error) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "reward_endpoint_backfill_failed",
                &error.to_string(),
            );
        }
    };
    report.attempted = ids.len();
    report.skipped += ids.len() - records.len();

    let decisions = match state.selector.fetch_by_ids(&ids).await {
        Ok(records) => records
            .into_iter()
            .map(|record| json!({"id": record.id, "reward": record.reward}))
            .collect::<Vec<_>>(),
        Err(error) => return store_error_response(&error),
    };

    tracing::info!(
        requested = report.attempted,
        updated = report.updated,
        skipped = report.skipped,
        failed = report.failed,
        "reward endpoint backfill completed"
    );
    (
        StatusCode::OK,
        Json(json!({
            "attempted": report.attempted,
            "updated": report.updated,
            "skipped": report.skipped,
            "failed": report.failed,
            "decisions": decisions,
        })),
    )
        .into_response()
}

fn store_error_response(error: &DecisionStoreError) -> Response {
    let status = if error.is_retryable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error_response(status, "reward_endpoint_store_error", &error.to_string())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        })),
    )
        .into_response()
}
