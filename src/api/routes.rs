//! Route handlers for the read-only price API.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::Query;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;

use crate::error::LtpError;
use crate::middleware::request_logging;
use crate::ratelimit::UpstreamLimiter;
use crate::service::{LtpResponse, LtpService};
use crate::upstream::{HybridClient, Mode};

/// Hard ceiling on one request's total work, refresh round-trips included.
const REQUEST_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LtpService>,
    pub hybrid: Arc<HybridClient>,
    pub limiter: Arc<UpstreamLimiter>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/ltp", get(get_ltp))
        .route("/api/v1/pairs", get(get_pairs))
        .route("/health", get(health))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Accepts both repeated `pair=` parameters and a comma-separated `pairs=`.
#[derive(Debug, Deserialize)]
struct LtpQuery {
    #[serde(default)]
    pair: Vec<String>,
    #[serde(default)]
    pairs: Option<String>,
}

impl LtpQuery {
    fn requested(&self) -> Vec<String> {
        let mut requested: Vec<String> = self
            .pair
            .iter()
            .map(|p| p.trim().to_ascii_uppercase())
            .filter(|p| !p.is_empty())
            .collect();

        if let Some(csv) = &self.pairs {
            requested.extend(
                csv.split(',')
                    .map(|p| p.trim().to_ascii_uppercase())
                    .filter(|p| !p.is_empty()),
            );
        }

        requested
    }
}

async fn get_ltp(
    State(state): State<AppState>,
    Query(query): Query<LtpQuery>,
) -> Result<Json<LtpResponse>, LtpError> {
    let requested = query.requested();

    match tokio::time::timeout(REQUEST_DEADLINE, state.service.get_ltp(&requested)).await {
        Ok(result) => result.map(Json),
        Err(_) => Err(LtpError::UpstreamUnavailable(format!(
            "request exceeded {REQUEST_DEADLINE:?}"
        ))),
    }
}

async fn get_pairs(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "pairs": state.service.supported_pairs(),
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mode = match state.hybrid.mode() {
        Mode::Streaming => "streaming",
        Mode::Fallback => "fallback",
    };

    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "upstream_mode": mode,
        "rate_limiter": state.limiter.stats(),
    }))
}
