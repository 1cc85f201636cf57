//! Control-surface HTTP API — §6.
//!
//! One axum `Router` covering every endpoint the spec names: liveness and
//! full health snapshot, model tier catalog and force_mode/persona apply,
//! and ops telemetry reports. The owner command surface (§6 "no HTTP
//! analogue") lives entirely on the `ChatTransport`/queue side and has no
//! route here. What does live here is `/api/events`, the inbound side of a
//! `ChatTransport` integration: the embedding application POSTs each `Event`
//! it receives from the chat platform there, and the Context Builder takes
//! it from there.

pub mod auth;
pub mod events;
pub mod health;
pub mod model;
pub mod rate_limit;
pub mod reports;
pub mod request_id;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/events", post(events::ingest))
        .route("/api/model/catalog", get(model::catalog))
        .route("/api/model/apply", post(model::apply))
        .route("/api/ops/reports/catalog", get(reports::catalog))
        .route("/api/ops/reports/latest/{id}", get(reports::latest))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), auth::auth_middleware));

    Router::new()
        .route("/health/lite", get(health::lite))
        .route("/health", get(health::full))
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), rate_limit::rate_limit_middleware))
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
        .with_state(state)
}
