//! Control-surface health endpoints — §4.5, §6.
//!
//! `/health/lite` is a dependency-free liveness probe, safe for a container
//! orchestrator; `/health` is the fuller snapshot of every backend the
//! Health & Watchdog Supervisor is tracking, for the operator-facing
//! control surface.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::health::HealthStatus;
use crate::state::AppState;

/// `GET /health/lite` — always 200, no dependencies. Safe as a container
/// liveness probe.
pub async fn lite() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// `GET /health` — full backend health snapshot plus process uptime.
pub async fn full(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backends = state.health.snapshot();
    let ready = !backends.iter().any(|b| b.status == HealthStatus::Down);
    let uptime_secs = state.started_at.elapsed().as_secs();

    Json(json!({
        "status": if ready { "ok" } else { "degraded" },
        "uptime_secs": uptime_secs,
        "backends": backends,
        "active_chats": state.queue.active_chats().await,
        "policy_entries": state.policy.len().await,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_app_state;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn full_reports_ok_with_no_backends_probed_yet() {
        let state = test_app_state("CHATLOOM_TEST_HEALTH_FULL");
        let response = full(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn full_reports_degraded_when_a_backend_is_down() {
        let state = test_app_state("CHATLOOM_TEST_HEALTH_DEGRADED");
        for _ in 0..5 {
            state.health.record_attempt("b", false);
        }
        let response = full(State(state)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "degraded");
    }
}
