//! Unified HTTP error type for axum request handlers.
//!
//! [`AppError`] wraps [`anyhow::Error`] and converts it into an appropriate
//! HTTP response automatically via [`IntoResponse`]. This means every handler
//! that can fail can return `Result<T, AppError>` and propagate errors with `?`
//! — no manual `map_err`, no boilerplate.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn my_handler(
//!     State(state): State<Arc<AppState>>,
//! ) -> Result<Json<Value>, AppError> {
//!     let result = state.some_fallible_operation().await?;
//!     Ok(Json(result))
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Canonical classification of a failed `Attempt`, independent of which
/// backend produced it. The Router only ever branches on
/// [`ErrorCode::is_transient`] — it never matches on backend-specific error
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Backend process not reachable (connection refused, DNS failure).
    BackendUnreachable,
    /// Backend reachable but returned 5xx or dropped the stream mid-flight.
    BackendError,
    /// Request exceeded its per-attempt timeout.
    Timeout,
    /// Backend-reported rate limit (429) or quota exhaustion.
    RateLimited,
    /// Cloud tier has no configured spend remaining this period.
    QuotaExceeded,
    /// Backend rejected the request as malformed (4xx other than 429).
    InvalidRequest,
    /// Backend or gateway auth failed (missing/expired key).
    AuthFailed,
    /// Guardrail tripped a reasoning or content tail-loop.
    LoopDetected,
    /// Guardrail tripped the reasoning-token cap.
    ReasoningCapped,
    /// Request's SLA deadline passed before a terminal outcome was reached.
    SlaExceeded,
    /// Request was cancelled by its owner (e.g. `/cancel`, queue eviction).
    Cancelled,
    /// Local config or policy state prevented the request from being planned.
    ConfigError,
    /// An owner-only command (`!policy`, `!model`, `!ops`, `!reactions`) was
    /// issued by a non-owner principal.
    BlockedNotOwner,
    /// Anything else — never routed on, only logged.
    Internal,
}

impl ErrorCode {
    /// Transient errors are eligible for same-tier retry or escalation;
    /// fatal ones end the Request immediately (§4.2, §7).
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::BackendUnreachable
                | ErrorCode::BackendError
                | ErrorCode::Timeout
                | ErrorCode::RateLimited
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BackendUnreachable => "backend_unreachable",
            ErrorCode::BackendError => "backend_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::QuotaExceeded => "quota_exceeded",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::LoopDetected => "loop_detected",
            ErrorCode::ReasoningCapped => "reasoning_capped",
            ErrorCode::SlaExceeded => "sla_exceeded",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::ConfigError => "config_error",
            ErrorCode::BlockedNotOwner => "blocked_not_owner",
            ErrorCode::Internal => "internal",
        }
    }

    /// Reply text sent to the chat when a Request ends without usable model
    /// output — the reply-completion guarantee of §4.3: the chat always gets
    /// *something* back, even on a fatal failure.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorCode::BackendUnreachable | ErrorCode::BackendError => {
                "The model backend is unavailable right now. I'll try again later."
            }
            ErrorCode::Timeout => "That took too long to answer, so I stopped waiting.",
            ErrorCode::RateLimited => "I'm being rate limited right now. Try again shortly.",
            ErrorCode::QuotaExceeded => "This tier's quota is used up for now.",
            ErrorCode::InvalidRequest => "I couldn't send that request as-is.",
            ErrorCode::AuthFailed => "A backend credential is missing or invalid.",
            ErrorCode::LoopDetected => "I caught myself repeating and stopped early.",
            ErrorCode::ReasoningCapped => "I hit my thinking budget on that one and stopped early.",
            ErrorCode::SlaExceeded => "That took longer than I'm allowed, so I stopped.",
            ErrorCode::Cancelled => "Cancelled.",
            ErrorCode::ConfigError => "I'm misconfigured for that right now.",
            ErrorCode::BlockedNotOwner => "Only the owner can do that.",
            ErrorCode::Internal => "Something went wrong on my end.",
        }
    }
}

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
///
/// Any type that implements `Into<anyhow::Error>` (which includes `io::Error`,
/// `reqwest::Error`, and any `#[derive(thiserror::Error)]` type) can be
/// converted into an [`AppError`] via the blanket [`From`] implementation.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "handler error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

/// Convert any `Into<anyhow::Error>` into an [`AppError`].
///
/// This is the idiomatic axum pattern — see
/// <https://docs.rs/axum/latest/axum/error_handling/index.html>.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_are_retryable() {
        assert!(ErrorCode::BackendUnreachable.is_transient());
        assert!(ErrorCode::Timeout.is_transient());
        assert!(ErrorCode::RateLimited.is_transient());
    }

    #[test]
    fn fatal_codes_are_not_transient() {
        assert!(!ErrorCode::InvalidRequest.is_transient());
        assert!(!ErrorCode::AuthFailed.is_transient());
        assert!(!ErrorCode::LoopDetected.is_transient());
        assert!(!ErrorCode::SlaExceeded.is_transient());
    }

    #[test]
    fn every_code_has_a_non_empty_user_message() {
        let codes = [
            ErrorCode::BackendUnreachable,
            ErrorCode::BackendError,
            ErrorCode::Timeout,
            ErrorCode::RateLimited,
            ErrorCode::QuotaExceeded,
            ErrorCode::InvalidRequest,
            ErrorCode::AuthFailed,
            ErrorCode::LoopDetected,
            ErrorCode::ReasoningCapped,
            ErrorCode::SlaExceeded,
            ErrorCode::Cancelled,
            ErrorCode::ConfigError,
            ErrorCode::BlockedNotOwner,
            ErrorCode::Internal,
        ];
        for code in codes {
            assert!(!code.user_message().is_empty());
        }
    }
}
