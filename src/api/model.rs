//! Model Router control-surface endpoints — §4.2, §6.
//!
//! Read-only tier catalog plus the one write path the control surface has
//! into routing: applying a force_mode/persona override for a chat through
//! the Policy & Context Store. Generalizes the teacher's profile-override
//! admin endpoint from a static `[[clients]]` lookup to a runtime store
//! keyed by `ChatId`.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ChatId;
use crate::error::AppError;
use crate::policy::ForceMode;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TierSummary {
    pub name: String,
    pub kind: String,
    pub backend: String,
    pub model: String,
    pub cost_per_1k_tokens_usd: f64,
}

/// `GET /api/model/catalog` — every configured tier, in config order.
pub async fn catalog(State(state): State<Arc<AppState>>) -> Json<Vec<TierSummary>> {
    let cfg = state.router.config().await;
    let tiers = cfg
        .tiers
        .iter()
        .map(|t| TierSummary {
            name: t.name.clone(),
            kind: t.kind.to_string(),
            backend: t.backend.clone(),
            model: t.model.clone(),
            cost_per_1k_tokens_usd: t.cost_per_1k_tokens_usd,
        })
        .collect();
    Json(tiers)
}

#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    pub chat_id: String,
    pub force_mode: Option<String>,
    pub persona: Option<String>,
}

/// `POST /api/model/apply` — set a chat's `force_mode` and/or `persona`
/// override, then return the resulting policy snapshot.
pub async fn apply(State(state): State<Arc<AppState>>, Json(req): Json<ApplyRequest>) -> Result<Json<Value>, AppError> {
    let chat_id = ChatId::from(req.chat_id);

    if let Some(mode) = req.force_mode {
        let mode: ForceMode = mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        state.policy.set_force_mode(&chat_id, mode).await;
    }

    if let Some(persona) = req.persona {
        state.policy.set_persona(&chat_id, persona).await;
    }

    let snapshot = state.policy.resolve(&chat_id).await;
    Ok(Json(serde_json::to_value(snapshot)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_app_state;

    #[tokio::test]
    async fn catalog_lists_configured_tiers() {
        let state = test_app_state("CHATLOOM_TEST_MODEL_CATALOG");
        let Json(tiers) = catalog(State(state)).await;
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].kind, "local");
    }

    #[tokio::test]
    async fn apply_sets_force_mode_and_persona() {
        let state = test_app_state("CHATLOOM_TEST_MODEL_APPLY");
        let req = ApplyRequest { chat_id: "c1".into(), force_mode: Some("cloud".into()), persona: Some("curt".into()) };
        let Json(result) = apply(State(Arc::clone(&state)), Json(req)).await.unwrap();
        assert_eq!(result["force_mode"], "cloud");
        assert_eq!(result["persona"], "curt");

        let snapshot = state.policy.resolve(&ChatId::from("c1")).await;
        assert_eq!(snapshot.force_mode, ForceMode::Cloud);
    }

    #[tokio::test]
    async fn apply_rejects_unknown_force_mode() {
        let state = test_app_state("CHATLOOM_TEST_MODEL_APPLY_BAD");
        let req = ApplyRequest { chat_id: "c1".into(), force_mode: Some("sideways".into()), persona: None };
        assert!(apply(State(state), Json(req)).await.is_err());
    }
}
