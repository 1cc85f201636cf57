//! Ops Telemetry & Alerts control-surface endpoints — §4.7, §6.
//!
//! Exposes the Ops Telemetry layer read-only: a catalog of report ids (one
//! per usage bucket touched this month, one per raised alert) and a detail
//! lookup by id. Generalizes the teacher's fixed traffic/stats admin view
//! into an id-addressed catalog, since the Ops layer now has two
//! independent report families instead of one.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ReportSummary {
    pub id: String,
    pub kind: &'static str,
    pub description: String,
}

/// `GET /api/ops/reports/catalog` — one entry per usage bucket touched this
/// month, plus one per alert ever raised (acked or not).
pub async fn catalog(State(state): State<Arc<AppState>>) -> Json<Vec<ReportSummary>> {
    let mut out = Vec::new();

    for (tier, model, bucket) in state.usage.month_report() {
        out.push(ReportSummary {
            id: format!("usage:{tier}:{model}"),
            kind: "usage",
            description: format!("{tier}/{model}: {} attempts, ${:.2}", bucket.attempts, bucket.cost_usd),
        });
    }

    for alert in state.alerts.all() {
        out.push(ReportSummary { id: format!("alert:{}", alert.code), kind: "alert", description: alert.message });
    }

    Json(out)
}

/// `GET /api/ops/reports/latest/{id}` — detail for one report id from the
/// catalog above.
pub async fn latest(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, AppError> {
    if let Some(rest) = id.strip_prefix("usage:") {
        let (tier, model) = rest.split_once(':').ok_or_else(|| anyhow::anyhow!("malformed usage report id `{id}`"))?;
        let bucket = state
            .usage
            .month_report()
            .into_iter()
            .find(|(t, m, _)| t == tier && m == model)
            .map(|(_, _, b)| b)
            .ok_or_else(|| anyhow::anyhow!("no usage report for `{id}`"))?;
        return Ok(Json(json!({ "id": id, "kind": "usage", "tier": tier, "model": model, "bucket": bucket })));
    }

    if let Some(code) = id.strip_prefix("alert:") {
        let alert = state
            .alerts
            .all()
            .into_iter()
            .find(|a| a.code == code)
            .ok_or_else(|| anyhow::anyhow!("no alert for `{id}`"))?;
        return Ok(Json(json!({ "id": id, "kind": "alert", "alert": alert })));
    }

    Err(anyhow::anyhow!("unknown report id `{id}`").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tier;
    use crate::ops::AlertSeverity;
    use crate::state::test_app_state;

    #[tokio::test]
    async fn catalog_includes_usage_and_alert_entries() {
        let state = test_app_state("CHATLOOM_TEST_REPORTS_CATALOG");
        state.usage.record(Tier::CloudPaid, "m1", 10, 1.0);
        state.alerts.raise("usage_warn", AlertSeverity::Warn, "over threshold");

        let Json(entries) = catalog(State(Arc::clone(&state))).await;
        assert!(entries.iter().any(|e| e.id == "usage:cloud_paid:m1"));
        assert!(entries.iter().any(|e| e.id == "alert:usage_warn"));
    }

    #[tokio::test]
    async fn latest_resolves_usage_report_by_id() {
        let state = test_app_state("CHATLOOM_TEST_REPORTS_LATEST_USAGE");
        state.usage.record(Tier::Local, "m2", 5, 0.0);

        let Json(detail) = latest(State(state), Path("usage:local:m2".to_string())).await.unwrap();
        assert_eq!(detail["kind"], "usage");
        assert_eq!(detail["bucket"]["attempts"], 1);
    }

    #[tokio::test]
    async fn latest_returns_error_for_unknown_id() {
        let state = test_app_state("CHATLOOM_TEST_REPORTS_LATEST_UNKNOWN");
        assert!(latest(State(state), Path("bogus:x".to_string())).await.is_err());
    }
}
