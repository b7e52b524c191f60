//! HTTP trigger surface.
//!
//! The guard's only externally observable interface: an authorized tick
//! request is accepted (202) and the work runs in the background, with
//! completion logged asynchronously — the time-boxed design never returns
//! computed results synchronously.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::guard::PhaseRotationGuard;

/// Shared state for the trigger routes.
#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<PhaseRotationGuard>,
    pub trigger_token: String,
}

/// Build the trigger router.
pub fn router(guard: Arc<PhaseRotationGuard>, config: &ServerConfig) -> Router {
    let state = AppState {
        guard,
        trigger_token: config.trigger_token.clone(),
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/engine/tick", post(tick))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn tick(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers, &state.trigger_token) {
        warn!("Rejected tick request: bad or missing bearer token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": "rejected" })),
        );
    }

    // Fire and continue: overlapping ticks are safe by construction
    // (claims and atomic counters), so there is no in-process mutex here.
    let guard = state.guard.clone();
    tokio::spawn(async move {
        match guard.tick().await {
            Ok(report) => info!(?report, "Triggered tick finished"),
            Err(e) => error!("Triggered tick failed: {e}"),
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" })))
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(v) = value {
            headers.insert(header::AUTHORIZATION, v.parse().unwrap());
        }
        headers
    }

    #[test]
    fn missing_header_is_rejected() {
        assert!(!authorized(&headers_with(None), "secret"));
    }

    #[test]
    fn wrong_token_is_rejected() {
        assert!(!authorized(&headers_with(Some("Bearer nope")), "secret"));
    }

    #[test]
    fn bare_token_without_scheme_is_rejected() {
        assert!(!authorized(&headers_with(Some("secret")), "secret"));
    }

    #[test]
    fn matching_bearer_token_is_accepted() {
        assert!(authorized(&headers_with(Some("Bearer secret")), "secret"));
    }
}
