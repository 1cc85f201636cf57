//! Configuration types for chat-loom.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. Secrets are never stored in
//! the TOML file — only the name of the environment variable that holds them.
//!
//! # Example
//! ```toml
//! [gateway]
//! control_port = 8080
//!
//! [backends.ollama]
//! base_url = "http://localhost:11434"
//!
//! [[tiers]]
//! name    = "local-main"
//! kind    = "local"
//! backend = "ollama"
//! model   = "qwen2.5:7b"
//!
//! [[tiers]]
//! name    = "cloud-free"
//! kind    = "cloud_free"
//! backend = "openrouter"
//! model   = "meta-llama/llama-3.1-8b-instruct:free"
//!
//! [router]
//! force_mode_default = "auto"
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::domain::Tier;
use crate::policy::ForceMode;

/// Which API protocol a backend speaks. chat-loom normalises all inter-tier
/// traffic to OpenAI's chat-completions schema; each [`Provider`] variant
/// maps to an adapter that translates at the edge (see `backends`).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Standard OpenAI `/v1/chat/completions` protocol. Also used by
    /// LM Studio, vLLM, OpenRouter, and most local inference servers.
    #[default]
    OpenAI,
    /// Ollama local inference server, native `/api/chat` endpoint.
    Ollama,
    /// Anthropic Messages API (`/v1/messages`).
    Anthropic,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAI => "openai",
            Self::Ollama => "ollama",
            Self::Anthropic => "anthropic",
        })
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub router: RouterSettings,

    /// Named backends (Ollama instance, OpenRouter, Anthropic direct, etc.)
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// Routing tiers. More than one tier may share a `kind` — the Router
    /// tries them as candidates up to `router.n_cloud_candidates` for the
    /// cloud kinds, and the first `local` tier for the local kind.
    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    /// Principal IDs (transport-specific user identifiers) treated as the
    /// owner for the purposes of gating owner-only commands (§4.6).
    #[serde(default)]
    pub owner_ids: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for tier in &self.tiers {
            anyhow::ensure!(
                self.backends.contains_key(&tier.backend),
                "tier `{}` references unknown backend `{}`",
                tier.name,
                tier.backend
            );
        }

        anyhow::ensure!(
            self.tiers.iter().any(|t| t.kind == Tier::Local),
            "config must define at least one tier with kind = \"local\""
        );
        anyhow::ensure!(
            self.tiers.iter().any(|t| t.kind.is_cloud()),
            "config must define at least one cloud tier (cloud_free or cloud_paid)"
        );

        anyhow::ensure!(
            self.router.n_cloud_candidates >= 1,
            "router.n_cloud_candidates must be >= 1"
        );
        anyhow::ensure!(
            self.router.cloud_autoswitch_cooldown_sec > 0,
            "router.cloud_autoswitch_cooldown_sec must be > 0"
        );

        Ok(())
    }

    /// Tiers matching a given routing tier kind, in config order. The
    /// Router consumes this as its candidate list for that kind (§4.2).
    pub fn tiers_of(&self, kind: Tier) -> Vec<&TierConfig> {
        self.tiers.iter().filter(|t| t.kind == kind).collect()
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name)
    }

    pub fn is_owner(&self, principal_id: &str) -> bool {
        self.owner_ids.iter().any(|o| o == principal_id)
    }
}

/// Core gateway/control-surface settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port the control-surface HTTP API listens on (`/health`,
    /// `/api/model/*`, `/api/ops/*`).
    #[serde(default = "defaults::control_port")]
    pub control_port: u16,

    /// Number of recent attempts to keep in the in-memory traffic log.
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Maximum control-surface requests per minute per source IP.
    /// Leave unset (or 0) to disable rate limiting.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// Environment variable holding the Bearer token required for the
    /// control surface (`WEB_API_KEY` by convention).
    #[serde(default = "defaults::web_api_key_env")]
    pub web_api_key_env: String,

    /// Per-attempt request timeout against a backend, in milliseconds.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failed attempts/probes required to trip a backend from UP
    /// to DEGRADED/DOWN (§4.5 hysteresis — consecutive counts, not an
    /// error-rate window).
    #[serde(default = "defaults::health_fail_threshold")]
    pub health_fail_threshold: u32,

    /// Consecutive successful attempts/probes required to heal a
    /// DEGRADED/DOWN backend back to UP.
    #[serde(default = "defaults::health_recover_threshold")]
    pub health_recover_threshold: u32,

    /// Interval between watchdog probe sweeps, in seconds.
    #[serde(default = "defaults::health_probe_interval_sec")]
    pub health_probe_interval_sec: u64,

    /// Maximum size of a per-chat FIFO work queue before new submissions
    /// are rejected (§4.1).
    #[serde(default = "defaults::queue_max")]
    pub queue_max: usize,

    /// How long a chat's worker task may sit idle before being reaped.
    #[serde(default = "defaults::idle_ttl_sec")]
    pub idle_ttl_sec: u64,

    /// Per-Request SLA: time budget from creation to terminal outcome.
    #[serde(default = "defaults::sla_sec")]
    pub sla_sec: u64,

    /// Interval at which a "still working" idle-chunk notice may be sent
    /// to the chat while a long attempt is in flight.
    #[serde(default = "defaults::idle_chunk_ms")]
    pub idle_chunk_ms: u64,

    /// TTL for Policy Store entries (§4.6).
    #[serde(default = "defaults::policy_ttl_sec")]
    pub policy_ttl_sec: u64,

    /// Maximum reasoning-channel tokens buffered per attempt before the
    /// reasoning-cap guardrail trips (§4.3).
    #[serde(default = "defaults::reasoning_cap_tokens")]
    pub reasoning_cap_tokens: u32,

    /// Maximum content-channel tokens buffered per attempt (bounds memory;
    /// does not itself trip a guardrail).
    #[serde(default = "defaults::content_cap_tokens")]
    pub content_cap_tokens: u32,

    /// Literal substrings that must never reach a reply (§4.3 "sentinel
    /// leak" guardrail) — system-prompt markers, internal tokens, etc.
    #[serde(default)]
    pub sentinel_markers: Vec<String>,

    /// Current-month `cloud_paid` spend (USD) at which a `usage_warn` alert
    /// is raised (§4.7). Advisory only — never blocks a request.
    #[serde(default = "defaults::usage_warn_threshold_usd")]
    pub usage_warn_threshold_usd: f64,

    /// Current-month `cloud_paid` spend (USD) at which a `usage_high` alert
    /// is raised (§4.7).
    #[serde(default = "defaults::usage_high_threshold_usd")]
    pub usage_high_threshold_usd: f64,

    /// Soft daily cap on free-tier cloud calls, past which `usage_warn`/
    /// `usage_high`-style alerts fire at 80%/100% (§4.7). Advisory only.
    #[serde(default = "defaults::free_cloud_daily_cap")]
    pub free_cloud_daily_cap: u64,

    /// Kill switch for the auto-reaction rate limiter (§4.4). Off by default
    /// — a deployment opts in explicitly.
    #[serde(default)]
    pub auto_reactions_enabled: bool,

    /// Minimum messages between automatic reactions in a chat when
    /// `auto_reactions_enabled` is set.
    #[serde(default = "defaults::auto_reaction_every_n")]
    pub auto_reaction_every_n: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            control_port: defaults::control_port(),
            traffic_log_capacity: defaults::traffic_log_capacity(),
            log_level: None,
            rate_limit_rpm: None,
            web_api_key_env: defaults::web_api_key_env(),
            timeout_ms: defaults::timeout_ms(),
            health_fail_threshold: defaults::health_fail_threshold(),
            health_recover_threshold: defaults::health_recover_threshold(),
            health_probe_interval_sec: defaults::health_probe_interval_sec(),
            queue_max: defaults::queue_max(),
            idle_ttl_sec: defaults::idle_ttl_sec(),
            sla_sec: defaults::sla_sec(),
            idle_chunk_ms: defaults::idle_chunk_ms(),
            policy_ttl_sec: defaults::policy_ttl_sec(),
            reasoning_cap_tokens: defaults::reasoning_cap_tokens(),
            content_cap_tokens: defaults::content_cap_tokens(),
            sentinel_markers: Vec::new(),
            usage_warn_threshold_usd: defaults::usage_warn_threshold_usd(),
            usage_high_threshold_usd: defaults::usage_high_threshold_usd(),
            free_cloud_daily_cap: defaults::free_cloud_daily_cap(),
            auto_reactions_enabled: false,
            auto_reaction_every_n: defaults::auto_reaction_every_n(),
        }
    }
}

/// Tunables for the Model Router's tier/fallback behaviour (§4.2).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterSettings {
    /// Default `force_mode` for chats with no owner override.
    #[serde(default)]
    pub force_mode_default: ForceMode,

    /// Minimum time between automatic cloud_free → cloud_paid switches.
    #[serde(default = "defaults::cloud_autoswitch_cooldown_sec")]
    pub cloud_autoswitch_cooldown_sec: u64,

    /// Once autoswitched to cloud_paid, stay there until explicitly reset
    /// rather than drop back to cloud_free on the next request.
    #[serde(default = "defaults::cloud_sticky_on_paid")]
    pub cloud_sticky_on_paid: bool,

    /// Maximum distinct cloud tier candidates tried for one Request before
    /// giving up and returning Fatal.
    #[serde(default = "defaults::n_cloud_candidates")]
    pub n_cloud_candidates: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            force_mode_default: ForceMode::Auto,
            cloud_autoswitch_cooldown_sec: defaults::cloud_autoswitch_cooldown_sec(),
            cloud_sticky_on_paid: defaults::cloud_sticky_on_paid(),
            n_cloud_candidates: defaults::n_cloud_candidates(),
        }
    }
}

/// A named backend (Ollama instance, OpenRouter, Anthropic direct, etc.).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base URL — must end without a trailing `/v1` (added by the client).
    pub base_url: String,

    /// Environment variable name whose value is the API key. Leave unset
    /// for keyless local backends (e.g. Ollama with no auth).
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Request timeout in milliseconds, overriding `gateway.timeout_ms`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Protocol adapter to use when talking to this backend.
    #[serde(default)]
    pub provider: Provider,

    /// Coarse cost class surfaced in `Plan::cost_estimate_usd` rounding and
    /// the `/api/model/catalog` listing — purely informational for free/local
    /// backends, meaningful for paid ones.
    #[serde(default)]
    pub quota_class: QuotaClass,
}

impl BackendConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(|var| std::env::var(var).ok())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuotaClass {
    #[default]
    Free,
    Paid,
}

/// A routing tier — a named combination of kind + backend + model.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierConfig {
    /// Unique tier name, e.g. `local-main`, `cloud-free-a`.
    pub name: String,

    /// Which routing tier this config entry belongs to.
    pub kind: Tier,

    /// Which backend to use (must exist in `[backends]`).
    pub backend: String,

    /// Model name to send to the backend.
    pub model: String,

    /// Maximum output tokens requested of the backend for this tier.
    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u32,

    /// Rough $/1K-token estimate used for `Plan::cost_estimate_usd` and the
    /// confirm-expensive gate. Zero for local/free tiers.
    #[serde(default)]
    pub cost_per_1k_tokens_usd: f64,
}

mod defaults {
    pub fn control_port() -> u16 { 8080 }
    pub fn traffic_log_capacity() -> usize { 500 }
    pub fn web_api_key_env() -> String { "WEB_API_KEY".to_string() }
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn health_fail_threshold() -> u32 { 3 }
    pub fn health_recover_threshold() -> u32 { 2 }
    pub fn health_probe_interval_sec() -> u64 { 30 }
    pub fn queue_max() -> usize { 50 }
    pub fn idle_ttl_sec() -> u64 { 300 }
    pub fn sla_sec() -> u64 { 90 }
    pub fn idle_chunk_ms() -> u64 { 4_000 }
    pub fn policy_ttl_sec() -> u64 { 86_400 }
    pub fn reasoning_cap_tokens() -> u32 { 4_000 }
    pub fn content_cap_tokens() -> u32 { 8_000 }
    pub fn cloud_autoswitch_cooldown_sec() -> u64 { 600 }
    pub fn cloud_sticky_on_paid() -> bool { true }
    pub fn n_cloud_candidates() -> usize { 2 }
    pub fn max_tokens() -> u32 { 2_048 }
    pub fn usage_warn_threshold_usd() -> f64 { 20.0 }
    pub fn usage_high_threshold_usd() -> f64 { 50.0 }
    pub fn free_cloud_daily_cap() -> u64 { 300 }
    pub fn auto_reaction_every_n() -> u32 { 20 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [backends.ollama]
            base_url = "http://localhost:11434"

            [backends.openrouter]
            base_url = "https://openrouter.ai/api"
            api_key_env = "OPENROUTER_KEY"

            [[tiers]]
            name    = "local-main"
            kind    = "local"
            backend = "ollama"
            model   = "qwen2.5:7b"

            [[tiers]]
            name    = "cloud-free"
            kind    = "cloud_free"
            backend = "openrouter"
            model   = "meta-llama/llama-3.1-8b-instruct:free"
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn validation_rejects_tier_with_unknown_backend() {
        let mut config = minimal_config();
        config.tiers.push(TierConfig {
            name: "bad".into(),
            kind: Tier::Local,
            backend: "nonexistent".into(),
            model: "x".into(),
            max_tokens: 100,
            cost_per_1k_tokens_usd: 0.0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_requires_a_local_tier() {
        let mut config = minimal_config();
        config.tiers.retain(|t| t.kind != Tier::Local);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_requires_a_cloud_tier() {
        let mut config = minimal_config();
        config.tiers.retain(|t| t.kind == Tier::Local);
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiers_of_filters_by_kind() {
        let config = minimal_config();
        assert_eq!(config.tiers_of(Tier::Local).len(), 1);
        assert_eq!(config.tiers_of(Tier::CloudFree).len(), 1);
        assert_eq!(config.tiers_of(Tier::CloudPaid).len(), 0);
    }

    #[test]
    fn owner_check_matches_configured_ids() {
        let mut config = minimal_config();
        config.owner_ids.push("u-owner".into());
        assert!(config.is_owner("u-owner"));
        assert!(!config.is_owner("u-other"));
    }

    #[test]
    fn gateway_defaults_are_applied_when_section_is_minimal() {
        let config = minimal_config();
        assert_eq!(config.gateway.control_port, 8080);
        assert_eq!(config.gateway.queue_max, 50);
        assert_eq!(config.gateway.sla_sec, 90);
        assert_eq!(config.router.n_cloud_candidates, 2);
        assert!(config.router.cloud_sticky_on_paid);
    }
}
