use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration, time::Instant};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod backends;
mod commands;
mod config;
mod domain;
mod engine;
mod error;
mod health;
mod ingest;
mod mood;
mod ops;
mod policy;
mod queue;
mod router;
mod state;
mod streaming;
mod traffic;
mod transport;

pub use config::Config;
pub use error::AppError;
pub use traffic::TrafficLog;

use api::rate_limit::RateLimiter;
use backends::{Backend, BackendClient};
use engine::Engine;
use health::HealthSupervisor;
use mood::MoodEngine;
use ops::{AlertBoard, UsageLedger};
use policy::PolicyStore;
use queue::{CancellationRegistry, ChatQueue};
use router::RouterState;
use state::AppState;
use transport::{ChatTransport, NullTransport};

/// Half-life for the Reaction & Mood Engine's decayed scores (§4.4). Not
/// config-exposed — six hours is long enough to smooth over a single bad
/// exchange without a restart resetting it.
const MOOD_HALF_LIFE: Duration = Duration::from_secs(6 * 3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a container HEALTHCHECK, hit /health/lite and exit
    // immediately — no external curl/wget dependency in the image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "chat_loom=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("CHATLOOM_CONFIG").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/etc/chat-loom/config.toml"));

    let config = Config::load(&config_path).with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(control_port = config.gateway.control_port, "chat-loom starting");

    let traffic_log = Arc::new(TrafficLog::new(config.gateway.traffic_log_capacity));
    let mood = MoodEngine::new(MOOD_HALF_LIFE);
    let config = Arc::new(config);

    let router_state = Arc::new(RouterState::new(Arc::clone(&config), config_path.clone(), Arc::clone(&traffic_log), Arc::clone(&mood)));

    let alerts = AlertBoard::new();
    let health = HealthSupervisor::new(
        config.gateway.health_fail_threshold,
        config.gateway.health_recover_threshold,
        Arc::clone(&alerts),
    );
    let usage = UsageLedger::new(
        config.gateway.usage_warn_threshold_usd,
        config.gateway.usage_high_threshold_usd,
        config.gateway.free_cloud_daily_cap,
    );
    let policy = PolicyStore::new(Duration::from_secs(config.gateway.policy_ttl_sec));

    // No concrete chat platform ships in this crate (§6 Non-goals) — the
    // embedding application swaps this for a real transport. `NullTransport`
    // keeps the process runnable (and load-testable) on its own.
    let transport: Arc<dyn ChatTransport> = Arc::new(NullTransport);

    let cancellations = CancellationRegistry::new();
    let engine = Engine::new(
        Arc::clone(&router_state),
        Arc::clone(&health),
        Arc::clone(&mood),
        Arc::clone(&usage),
        Arc::clone(&alerts),
        Arc::clone(&transport),
        Arc::clone(&cancellations),
    );
    let queue = ChatQueue::new(engine, config.gateway.queue_max, Duration::from_secs(config.gateway.idle_ttl_sec), cancellations);

    let rate_limiter = config.gateway.rate_limit_rpm.map(RateLimiter::new);

    let app_state = Arc::new(AppState {
        router: Arc::clone(&router_state),
        queue,
        policy: Arc::clone(&policy),
        health: Arc::clone(&health),
        mood,
        usage,
        alerts,
        transport,
        rate_limiter,
        started_at: Instant::now(),
    });

    tokio::spawn(config_watcher(Arc::clone(&router_state)));
    tokio::spawn(health_probe_loop(Arc::clone(&health), Arc::clone(&router_state)));
    tokio::spawn(policy_reaper_loop(policy));

    let control_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.control_port).parse()?;
    info!(%control_addr, "control surface listening");
    let control_listener = tokio::net::TcpListener::bind(control_addr).await?;

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::router(app_state).layer(trace_layer);

    tokio::select! {
        result = axum::serve(control_listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("control surface server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler").recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health/lite and exit 0 on 200, 1 otherwise.
/// Invoked via `chat-loom --healthcheck` from a container HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("CHATLOOM_CONTROL_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/health/lite");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on
/// mtime change. Parse failures are logged and ignored; the running config
/// is left unchanged.
async fn config_watcher(state: Arc<RouterState>) {
    let path = &state.config_path;

    let mut last_mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(path) {
            Ok(new_cfg) => {
                state.replace_config(Arc::new(new_cfg));
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}

/// Background task: sweeps every configured backend on a fixed interval
/// through the Health & Watchdog Supervisor (§4.5). Reads the probe interval
/// fresh from config each tick so a hot-reload takes effect without a
/// restart.
async fn health_probe_loop(health: Arc<HealthSupervisor>, router_state: Arc<RouterState>) {
    loop {
        let cfg = router_state.config().await;
        let interval = Duration::from_secs(cfg.gateway.health_probe_interval_sec.max(1));
        tokio::time::sleep(interval).await;

        let backends: Vec<(String, Arc<dyn Backend>)> = cfg
            .backends
            .iter()
            .filter_map(|(name, backend_cfg)| match BackendClient::new(backend_cfg, cfg.gateway.timeout_ms) {
                Ok(client) => Some((name.clone(), Arc::new(client) as Arc<dyn Backend>)),
                Err(e) => {
                    warn!(backend = %name, error = %e, "skipping probe — backend client could not be built");
                    None
                }
            })
            .collect();

        health.probe_once(backends).await;
    }
}

/// Background task: sweeps TTL-expired Policy & Context Store entries
/// (§4.6) on a fixed interval, independent of the per-chat worker reaping
/// the Chat Work Queue does for idle chats.
async fn policy_reaper_loop(policy: Arc<PolicyStore>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let removed = policy.sweep_expired().await;
        if removed > 0 {
            info!(removed, "swept expired policy entries");
        }
    }
}
