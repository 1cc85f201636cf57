//! Bearer-token gate for the control surface — §6.
//!
//! `/api/model/*` and `/api/ops/*` require `Authorization: Bearer <token>`,
//! checked against the value of the environment variable named by
//! `gateway.web_api_key_env`. `/health/lite` and `/health` are mounted
//! outside this middleware so orchestrators can probe liveness without a
//! credential. Generalizes the teacher's admin Bearer check, unchanged in
//! shape — just resolved from config instead of a fixed field.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

pub async fn auth_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let cfg = state.router.config().await;
    let expected = match std::env::var(&cfg.gateway.web_api_key_env) {
        Ok(v) if !v.is_empty() => v,
        _ => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => next.run(req).await,
        _ => (StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_app_state;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/protected", get(ok_handler))
            .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), auth_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn missing_credential_env_var_disables_auth() {
        unsafe { std::env::remove_var("CHATLOOM_TEST_AUTH_KEY") };
        let state = test_app_state("CHATLOOM_TEST_AUTH_KEY");
        let response = app(state)
            .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_bearer_header_is_rejected_when_key_is_set() {
        unsafe { std::env::set_var("CHATLOOM_TEST_AUTH_KEY_2", "secret") };
        let state = test_app_state("CHATLOOM_TEST_AUTH_KEY_2");

        let response = app(state)
            .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        unsafe { std::env::remove_var("CHATLOOM_TEST_AUTH_KEY_2") };
    }

    #[tokio::test]
    async fn correct_bearer_token_is_accepted() {
        unsafe { std::env::set_var("CHATLOOM_TEST_AUTH_KEY_3", "secret") };
        let state = test_app_state("CHATLOOM_TEST_AUTH_KEY_3");

        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        unsafe { std::env::remove_var("CHATLOOM_TEST_AUTH_KEY_3") };
    }
}
