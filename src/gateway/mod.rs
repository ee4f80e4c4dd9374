//! Axum HTTP surface.
//!
//! A thin shim over the orchestrator: one route triggers a review,
//! one reports liveness. Body limits and a generous whole-request
//! timeout (reviews run for minutes) guard the listener.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::review::types::{OutcomeStatus, ReviewOutcome};
use crate::review::ReviewOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ReviewOrchestrator>,
}

pub fn router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/review/:project/:repo/:pr_id", post(trigger_review))
        .layer(RequestBodyLimitLayer::new(server.max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(server.request_timeout_secs)))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn trigger_review(
    State(state): State<AppState>,
    Path((project, repo, pr_id)): Path<(String, String, i64)>,
) -> impl IntoResponse {
    let request_id = Uuid::new_v4();
    tracing::info!(%request_id, project, repo, pr_id, "review requested");

    let outcome = state.orchestrator.run(&project, &repo, pr_id).await;
    tracing::info!(%request_id, pr_id, status = ?outcome.status, "review finished");

    (status_code_for(&outcome), Json(outcome))
}

/// Outcome-to-HTTP mapping; rate limiting surfaces as 429 so callers
/// can back off.
fn status_code_for(outcome: &ReviewOutcome) -> StatusCode {
    match outcome.status {
        OutcomeStatus::Reviewed | OutcomeStatus::Skipped => StatusCode::OK,
        OutcomeStatus::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        OutcomeStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
