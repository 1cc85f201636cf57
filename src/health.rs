//! Health & Watchdog Supervisor — §4.5.
//!
//! Probes every configured backend on a fixed interval, bounded to a small
//! number of concurrent in-flight probes so a slow/hanging backend can't
//! starve the others. Each backend's state is a simple hysteresis machine —
//! UP → DEGRADED → DOWN and back — gated by consecutive fail/ok streaks
//! rather than an error-rate window, so a single flaky probe can't flap the
//! reported status but a backend that's actually healthy again recovers as
//! soon as it proves it `health_recover_threshold` times in a row. Grounded
//! on the cooldown/backoff shape of `other_examples/.../provider_health.rs`'s
//! `ProviderHealthTracker`, adapted from per-account to per-backend and from
//! exponential backoff to a fixed probe interval with consecutive-streak
//! hysteresis.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::backends::Backend;
use crate::ops::{AlertBoard, AlertSeverity};

const MAX_CONCURRENT_PROBES: usize = 4;

/// Tri-state health classification, matching §4.5's hysteresis machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
}

struct BackendHealth {
    status: HealthStatus,
    consecutive_fails: u32,
    consecutive_oks: u32,
}

impl BackendHealth {
    fn fresh() -> Self {
        Self { status: HealthStatus::Up, consecutive_fails: 0, consecutive_oks: 0 }
    }

    /// Apply one probe/attempt outcome and return the new status if it
    /// changed from what it was before this call, `None` otherwise.
    fn record(&mut self, ok: bool, fail_threshold: u32, recover_threshold: u32) -> Option<HealthStatus> {
        let previous = self.status;

        if ok {
            self.consecutive_oks += 1;
            self.consecutive_fails = 0;
        } else {
            self.consecutive_fails += 1;
            self.consecutive_oks = 0;
        }

        self.status = match self.status {
            HealthStatus::Up => {
                if self.consecutive_fails >= fail_threshold {
                    HealthStatus::Down
                } else if self.consecutive_fails > 0 {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Up
                }
            }
            HealthStatus::Degraded | HealthStatus::Down => {
                if self.consecutive_oks >= recover_threshold {
                    HealthStatus::Up
                } else if self.consecutive_fails >= fail_threshold {
                    HealthStatus::Down
                } else if self.consecutive_fails > 0 {
                    HealthStatus::Degraded
                } else {
                    self.status
                }
            }
        };

        if self.status != previous { Some(self.status) } else { None }
    }
}

/// Point-in-time snapshot exposed via `/health` and `/api/ops/*`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub backend: String,
    pub status: HealthStatus,
    pub consecutive_fails: u32,
    pub consecutive_oks: u32,
}

/// Bounded, coalescing probe loop plus queryable live status per backend.
pub struct HealthSupervisor {
    backends: DashMap<String, BackendHealth>,
    probe_semaphore: Arc<Semaphore>,
    fail_threshold: u32,
    recover_threshold: u32,
    alerts: Arc<AlertBoard>,
}

impl HealthSupervisor {
    pub fn new(fail_threshold: u32, recover_threshold: u32, alerts: Arc<AlertBoard>) -> Arc<Self> {
        Arc::new(Self {
            backends: DashMap::new(),
            probe_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES)),
            fail_threshold: fail_threshold.max(1),
            recover_threshold: recover_threshold.max(1),
            alerts,
        })
    }

    /// Record the outcome of a *live traffic* attempt against `backend`,
    /// independent of the periodic probe loop — a real request failing is
    /// just as informative as a synthetic probe (§4.5 "independent liveness
    /// and deep-health signals"). Raises/clears backend alerts on transition.
    pub fn record_attempt(&self, backend: &str, ok: bool) {
        let mut entry = self.backends.entry(backend.to_string()).or_insert_with(BackendHealth::fresh);
        if let Some(new_status) = entry.record(ok, self.fail_threshold, self.recover_threshold) {
            self.on_transition(backend, new_status);
        }
    }

    fn on_transition(&self, backend: &str, new_status: HealthStatus) {
        let code = format!("backend_health:{backend}");
        match new_status {
            HealthStatus::Down => {
                self.alerts.raise(&code, AlertSeverity::High, &format!("backend `{backend}` is DOWN"));
                warn!(backend, "backend transitioned to DOWN");
            }
            HealthStatus::Degraded => {
                self.alerts.raise(&code, AlertSeverity::Warn, &format!("backend `{backend}` is degraded"));
                warn!(backend, "backend transitioned to DEGRADED");
            }
            HealthStatus::Up => {
                self.alerts.ack(&code);
                info!(backend, "backend recovered to UP");
            }
        }
    }

    pub fn status(&self, backend: &str) -> HealthStatus {
        self.backends.get(backend).map(|e| e.status).unwrap_or(HealthStatus::Up)
    }

    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        self.backends
            .iter()
            .map(|entry| HealthSnapshot {
                backend: entry.key().clone(),
                status: entry.status,
                consecutive_fails: entry.consecutive_fails,
                consecutive_oks: entry.consecutive_oks,
            })
            .collect()
    }

    /// One sweep of active probing across all named backends, bounded to
    /// `MAX_CONCURRENT_PROBES` in flight at once. Coalesces naturally: a
    /// backend already mid-probe from a prior sweep simply holds its permit
    /// a little longer, rather than stacking a second concurrent probe. A
    /// backend that just tripped DOWN gets one soft-heal attempt
    /// (`Backend::reload`) right away rather than waiting for a human or the
    /// next probe cycle to notice (§4.5 "soft-heal").
    pub async fn probe_once(self: &Arc<Self>, backends: Vec<(String, Arc<dyn Backend>)>) {
        let mut handles = Vec::with_capacity(backends.len());
        for (name, backend) in backends {
            let supervisor = Arc::clone(self);
            let permit = Arc::clone(&self.probe_semaphore)
                .acquire_owned()
                .await
                .expect("probe semaphore never closed");
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let ok = backend.health_check().await.is_ok();
                let was_down = supervisor.status(&name) == HealthStatus::Down;
                supervisor.record_attempt(&name, ok);
                if !ok {
                    warn!(backend = %name, "health probe failed");
                    if !was_down && supervisor.status(&name) == HealthStatus::Down {
                        if let Err(e) = backend.reload().await {
                            warn!(backend = %name, error = %e, "soft-heal reload failed");
                        }
                    }
                } else {
                    info!(backend = %name, "health probe ok");
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }
}
