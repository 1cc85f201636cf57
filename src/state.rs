//! Process-wide application state — the single struct the control-surface
//! handlers and background tasks share, as opposed to `RouterState`, which
//! is narrowly scoped to routing concerns and also threaded through the
//! Engine. Grounded on the teacher's single `RouterState` struct, split in
//! two here because the new domain has materially more shared state than
//! the teacher's router+traffic pair.

use std::sync::Arc;
use std::time::Instant;

use crate::api::rate_limit::RateLimiter;
use crate::engine::Engine;
use crate::health::HealthSupervisor;
use crate::mood::MoodEngine;
use crate::ops::{AlertBoard, UsageLedger};
use crate::policy::PolicyStore;
use crate::queue::ChatQueue;
use crate::router::RouterState;
use crate::transport::ChatTransport;

pub struct AppState {
    pub router: Arc<RouterState>,
    pub queue: Arc<ChatQueue<Engine>>,
    pub policy: Arc<PolicyStore>,
    pub health: Arc<HealthSupervisor>,
    pub mood: Arc<MoodEngine>,
    pub usage: Arc<UsageLedger>,
    pub alerts: Arc<AlertBoard>,
    /// Same transport instance the `Engine` replies through — the control
    /// surface's event-ingestion endpoint (`api::events::ingest`) needs it to
    /// resolve author/provenance for an inbound `Event` (§2, §4.6).
    pub transport: Arc<dyn ChatTransport>,
    pub rate_limiter: Option<RateLimiter>,
    pub started_at: Instant,
}

/// Test-only `AppState` builder shared by the `api::*` handler test modules,
/// backed by a single local tier and a null transport. `web_api_key_env`
/// lets auth tests point at their own scratch env var without colliding.
#[cfg(test)]
pub fn test_app_state(web_api_key_env: &str) -> Arc<AppState> {
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::config::{BackendConfig, Config, GatewayConfig, Provider, TierConfig};
    use crate::domain::Tier;
    use crate::ops::{AlertBoard, UsageLedger};
    use crate::router::RouterState;
    use crate::transport::NullTransport;

    let mut backends = std::collections::HashMap::new();
    backends.insert(
        "b".to_string(),
        BackendConfig { base_url: "http://x".into(), api_key_env: None, timeout_ms: None, provider: Provider::Ollama, quota_class: Default::default() },
    );
    let cfg = Config {
        gateway: GatewayConfig { web_api_key_env: web_api_key_env.to_string(), ..Default::default() },
        router: Default::default(),
        backends,
        tiers: vec![TierConfig { name: "local".into(), kind: Tier::Local, backend: "b".into(), model: "m".into(), max_tokens: 100, cost_per_1k_tokens_usd: 0.0 }],
        owner_ids: Vec::new(),
    };

    let traffic = Arc::new(crate::traffic::TrafficLog::new(10));
    let mood = MoodEngine::new(Duration::from_secs(3600));
    let router = Arc::new(RouterState::new(Arc::new(cfg), PathBuf::from("/dev/null"), traffic, Arc::clone(&mood)));
    let alerts = AlertBoard::new();
    let health = HealthSupervisor::new(3, 2, Arc::clone(&alerts));
    let usage = UsageLedger::new(10.0, 20.0, 300);
    let policy = PolicyStore::new(Duration::from_secs(60));
    let transport: Arc<dyn ChatTransport> = Arc::new(NullTransport);
    let cancellations = crate::queue::CancellationRegistry::new();
    let engine = Engine::new(
        Arc::clone(&router),
        Arc::clone(&health),
        Arc::clone(&mood),
        Arc::clone(&usage),
        Arc::clone(&alerts),
        Arc::clone(&transport),
        Arc::clone(&cancellations),
    );
    let queue = ChatQueue::new(engine, 10, Duration::from_secs(60), cancellations);

    Arc::new(AppState { router, queue, policy, health, mood, usage, alerts, transport, rate_limiter: None, started_at: Instant::now() })
}
