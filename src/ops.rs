//! Ops Telemetry & Alerts — §4.7.
//!
//! Two small pieces of process-wide state layered on top of
//! `traffic::TrafficLog`: a month-bucketed usage ledger (so "how much have we
//! spent this month" survives a process restart's worth of traffic-log
//! eviction) and a deduplicated alert list for soft-cap and health events.
//! The alert ring buffer is grounded on
//! `other_examples/.../provider_health.rs`'s `fallback_events` log, adapted
//! from an append-only ring to a dedup-by-`code` table with ack/unack.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Tier;

/// Key for one usage bucket: calendar month + tier + model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UsageKey {
    year: i32,
    month: u32,
    tier: Tier,
    model_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageBucket {
    pub attempts: u64,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Month-bucketed spend/usage counters per `(tier, model_id)`. Reset
/// implicitly by calendar rollover — a new month starts a fresh bucket
/// rather than the ledger trying to roll totals forward.
pub struct UsageLedger {
    buckets: Mutex<HashMap<UsageKey, UsageBucket>>,
    /// Soft-cap thresholds, in USD, for the current month's `cloud_paid`
    /// spend. Advisory only — never blocks a request (§4.7).
    pub warn_threshold_usd: f64,
    pub high_threshold_usd: f64,
    /// Day-bucketed count of `cloud_free` calls, for the daily soft cap.
    free_calls_by_day: Mutex<HashMap<NaiveDate, u64>>,
    /// Soft-cap on `cloud_free` calls per calendar day. Advisory only —
    /// never blocks a request (§4.7); crossing it only raises an alert.
    pub free_cloud_daily_cap: u64,
}

impl UsageLedger {
    pub fn new(warn_threshold_usd: f64, high_threshold_usd: f64, free_cloud_daily_cap: u64) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
            warn_threshold_usd,
            high_threshold_usd,
            free_calls_by_day: Mutex::new(HashMap::new()),
            free_cloud_daily_cap,
        })
    }

    pub fn record(&self, tier: Tier, model_id: &str, tokens: u64, cost_usd: f64) {
        let now = Utc::now();
        let key = UsageKey { year: now.year(), month: now.month(), tier, model_id: model_id.to_string() };
        let mut buckets = self.buckets.lock().expect("usage ledger mutex poisoned");
        let bucket = buckets.entry(key).or_default();
        bucket.attempts += 1;
        bucket.tokens += tokens;
        bucket.cost_usd += cost_usd;
        drop(buckets);

        if tier == Tier::CloudFree {
            let mut days = self.free_calls_by_day.lock().expect("usage ledger mutex poisoned");
            *days.entry(now.date_naive()).or_insert(0) += 1;
        }
    }

    /// Count of `cloud_free` calls made so far today (UTC).
    pub fn today_free_cloud_calls(&self) -> u64 {
        let today = Utc::now().date_naive();
        let days = self.free_calls_by_day.lock().expect("usage ledger mutex poisoned");
        days.get(&today).copied().unwrap_or(0)
    }

    /// Total `cloud_paid` spend for the current calendar month, across all
    /// models — the figure the soft-cap thresholds are compared against.
    pub fn current_month_paid_spend_usd(&self) -> f64 {
        let now = Utc::now();
        let buckets = self.buckets.lock().expect("usage ledger mutex poisoned");
        buckets
            .iter()
            .filter(|(k, _)| k.year == now.year() && k.month == now.month() && k.tier == Tier::CloudPaid)
            .map(|(_, v)| v.cost_usd)
            .sum()
    }

    /// Snapshot of every bucket touched this month, for the
    /// `/api/ops/reports/*` surface.
    pub fn month_report(&self) -> Vec<(String, String, UsageBucket)> {
        let now = Utc::now();
        let buckets = self.buckets.lock().expect("usage ledger mutex poisoned");
        buckets
            .iter()
            .filter(|(k, _)| k.year == now.year() && k.month == now.month())
            .map(|(k, v)| (k.tier.to_string(), k.model_id.clone(), v.clone()))
            .collect()
    }
}

/// Severity tag for display/sort purposes; does not affect dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warn,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Stable identity for dedup — e.g. `"usage_warn"`, `"backend_down:ollama"`.
    pub code: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u64,
    pub acked: bool,
}

const MAX_ALERTS: usize = 200;

/// De-duplicated, ack-able alert table. Raising the same `code` twice bumps
/// `occurrences`/`last_seen` on the existing entry rather than creating a
/// new one; acking is idempotent (acking an already-acked alert is a no-op,
/// not an error).
pub struct AlertBoard {
    alerts: Mutex<Vec<Alert>>,
}

impl AlertBoard {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self { alerts: Mutex::new(Vec::new()) })
    }

    pub fn raise(&self, code: &str, severity: AlertSeverity, message: &str) {
        let now = Utc::now();
        let mut alerts = self.alerts.lock().expect("alert board mutex poisoned");
        if let Some(existing) = alerts.iter_mut().find(|a| a.code == code) {
            existing.last_seen = now;
            existing.occurrences += 1;
            existing.severity = severity;
            existing.message = message.to_string();
            return;
        }
        if alerts.len() >= MAX_ALERTS {
            // Drop the oldest unacked alert to make room; acked alerts are
            // kept longer since they're already resolved and cheap to show.
            if let Some(idx) = alerts.iter().position(|a| !a.acked) {
                alerts.remove(idx);
            } else {
                alerts.remove(0);
            }
        }
        alerts.push(Alert {
            code: code.to_string(),
            severity,
            message: message.to_string(),
            first_seen: now,
            last_seen: now,
            occurrences: 1,
            acked: false,
        });
    }

    /// Ack is idempotent: acking twice, or acking a code that doesn't exist,
    /// is not an error — it simply leaves the board unchanged.
    pub fn ack(&self, code: &str) {
        let mut alerts = self.alerts.lock().expect("alert board mutex poisoned");
        if let Some(a) = alerts.iter_mut().find(|a| a.code == code) {
            a.acked = true;
        }
    }

    pub fn unack(&self, code: &str) {
        let mut alerts = self.alerts.lock().expect("alert board mutex poisoned");
        if let Some(a) = alerts.iter_mut().find(|a| a.code == code) {
            a.acked = false;
        }
    }

    pub fn active(&self) -> Vec<Alert> {
        self.alerts.lock().expect("alert board mutex poisoned").iter().filter(|a| !a.acked).cloned().collect()
    }

    pub fn all(&self) -> Vec<Alert> {
        self.alerts.lock().expect("alert board mutex poisoned").clone()
    }
}

/// Check the current month's paid spend and today's free-cloud call count
/// against their soft-cap thresholds, raising the corresponding advisory
/// alerts. Called after each attempt completes. Neither cap ever blocks a
/// request (§4.7) — crossing one only raises an alert for a human to see.
pub fn evaluate_usage_alerts(ledger: &UsageLedger, board: &AlertBoard) {
    let spend = ledger.current_month_paid_spend_usd();
    if spend >= ledger.high_threshold_usd {
        board.raise(
            "usage_high",
            AlertSeverity::High,
            &format!("cloud_paid spend ${spend:.2} has reached the configured cap"),
        );
    } else if spend >= ledger.warn_threshold_usd {
        board.raise(
            "usage_warn",
            AlertSeverity::Warn,
            &format!("cloud_paid spend ${spend:.2} has crossed the warn threshold"),
        );
    }

    if ledger.free_cloud_daily_cap == 0 {
        return;
    }
    let calls = ledger.today_free_cloud_calls();
    let high_mark = ledger.free_cloud_daily_cap;
    let warn_mark = (ledger.free_cloud_daily_cap as f64 * 0.8).round() as u64;
    if calls >= high_mark {
        board.raise(
            "free_cloud_daily_high",
            AlertSeverity::High,
            &format!("cloud_free calls today ({calls}) have reached the daily cap of {high_mark}"),
        );
    } else if calls >= warn_mark {
        board.raise(
            "free_cloud_daily_warn",
            AlertSeverity::Warn,
            &format!("cloud_free calls today ({calls}) have crossed 80% of the daily cap of {high_mark}"),
        );
    }
}
