//! Model Router — §4.2.
//!
//! Resolves a `Plan` for the next `Attempt` of a `Request`, and classifies a
//! finished attempt's failure (if any) into a routing decision for the next
//! one. Three tiers — `local`, `cloud_free`, `cloud_paid` — replace the
//! teacher's cost-ladder-of-N-tiers model; `force_mode` replaces per-client
//! profiles; and fallback is driven by transient/fatal *classification* of
//! the previous attempt, never by a "is this answer good enough" heuristic
//! the way the teacher's `is_sufficient()` worked.
//!
//! What carries over from the teacher almost unchanged: the `RwLock<Arc<Config>>`
//! hot-swap pattern (`RouterState::replace_config`), the `#[tracing::instrument]`
//! request-scoped logging, and building errors with `anyhow::Context`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tiktoken_rs::CoreBPE;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::backends::BackendClient;
use crate::config::{Config, TierConfig};
use crate::domain::{Context, Outcome, Plan, Tier};
use crate::error::ErrorCode;
use crate::health::{HealthStatus, HealthSupervisor};
use crate::mood::MoodEngine;
use crate::ops::UsageLedger;
use crate::policy::ForceMode;
use crate::traffic::TrafficLog;

/// Process-wide state of the cloud autoswitch hysteresis machine (§4.2
/// "free → paid autoswitch" and "sticky-paid"). There is exactly one of
/// these per running process — it is not per-chat, since the spend budget
/// it protects is shared across the whole deployment.
pub struct CloudTierState {
    /// True once an automatic cloud_free → cloud_paid switch has happened
    /// and `cloud_sticky_on_paid` is configured — subsequent plans skip
    /// cloud_free entirely until this is reset.
    stuck_on_paid: AtomicBool,
    last_autoswitch_epoch_ms: AtomicI64,
    cooldown: Duration,
    sticky: bool,
}

impl CloudTierState {
    pub fn new(cooldown: Duration, sticky: bool) -> Arc<Self> {
        Arc::new(Self {
            stuck_on_paid: AtomicBool::new(false),
            last_autoswitch_epoch_ms: AtomicI64::new(i64::MIN),
            cooldown,
            sticky,
        })
    }

    pub fn is_sticky_paid(&self) -> bool {
        self.sticky && self.stuck_on_paid.load(Ordering::Acquire)
    }

    /// Attempt to record an automatic free→paid switch. Returns `false` if
    /// the cooldown since the last switch hasn't elapsed — callers should
    /// then treat cloud_free as exhausted for this Request rather than
    /// retrying the switch.
    pub fn try_autoswitch(&self, epoch_ms: i64) -> bool {
        let last = self.last_autoswitch_epoch_ms.load(Ordering::Acquire);
        if last != i64::MIN {
            let elapsed_ms = epoch_ms.saturating_sub(last);
            if elapsed_ms < self.cooldown.as_millis() as i64 {
                return false;
            }
        }
        self.last_autoswitch_epoch_ms.store(epoch_ms, Ordering::Release);
        if self.sticky {
            self.stuck_on_paid.store(true, Ordering::Release);
        }
        true
    }

    pub fn reset(&self) {
        self.stuck_on_paid.store(false, Ordering::Release);
        self.last_autoswitch_epoch_ms.store(i64::MIN, Ordering::Release);
    }
}

/// Shared state threaded through every request handler. Config is stored
/// behind `RwLock<Arc<Config>>` — readers clone the inner `Arc` under a
/// brief read lock, writers replace the whole `Arc` under a brief write
/// lock, so a config reload never blocks an in-flight request (teacher's
/// hot-swap idiom, unchanged).
pub struct RouterState {
    config: RwLock<Arc<Config>>,
    pub config_path: PathBuf,
    pub traffic_log: Arc<TrafficLog>,
    pub cloud_tier: Arc<CloudTierState>,
    pub mood: Arc<MoodEngine>,
}

impl RouterState {
    pub fn new(
        config: Arc<Config>,
        config_path: PathBuf,
        traffic_log: Arc<TrafficLog>,
        mood: Arc<MoodEngine>,
    ) -> Self {
        let cloud_tier = CloudTierState::new(
            Duration::from_secs(config.router.cloud_autoswitch_cooldown_sec),
            config.router.cloud_sticky_on_paid,
        );
        Self {
            config: RwLock::new(config),
            config_path,
            traffic_log,
            cloud_tier,
            mood,
        }
    }

    pub async fn config(&self) -> Arc<Config> {
        Arc::clone(&*self.config.read().await)
    }

    pub fn replace_config(&self, new_config: Arc<Config>) {
        // The reload loop runs on a fixed interval with no other writer
        // contending, so a failed try_write only ever means we raced a
        // reader — safe to skip this tick and retry on the next one.
        if let Ok(mut guard) = self.config.try_write() {
            *guard = new_config;
        }
    }

    pub fn backend_client(&self, cfg: &Config, tier: &TierConfig) -> anyhow::Result<BackendClient> {
        let backend_cfg = cfg
            .backend(&tier.backend)
            .ok_or_else(|| anyhow::anyhow!("tier `{}` references unknown backend `{}`", tier.name, tier.backend))?;
        BackendClient::new(backend_cfg, cfg.gateway.timeout_ms)
    }
}

/// Build the initial `Plan` for a brand-new `Request`, before any attempt has
/// run. Honors `force_mode`; in `auto` mode always starts on `local` — the
/// first cloud attempt only ever happens as a fallback from a failed local
/// attempt, never as the opening move (§4.2 "one-shot local→cloud fallback").
#[instrument(skip(state, cfg, ctx, health, usage), fields(force_mode = ?ctx.policy_snapshot.force_mode))]
pub fn plan_initial(
    state: &RouterState,
    cfg: &Config,
    ctx: &Context,
    payload: &str,
    health: &HealthSupervisor,
    usage: &UsageLedger,
) -> anyhow::Result<Plan> {
    let force_mode = ctx.policy_snapshot.force_mode;
    let starting_tier = match force_mode {
        ForceMode::Local => Tier::Local,
        ForceMode::Cloud => cloud_entry_tier(state, cfg),
        ForceMode::Auto => Tier::Local,
    };
    build_plan(state, cfg, ctx, starting_tier, "initial", payload, health, usage)
}

/// Decide the `Tier` a fresh cloud plan should open on: `cloud_free` unless
/// the process is stuck on paid (sticky autoswitch) or no free tier exists.
fn cloud_entry_tier(state: &RouterState, cfg: &Config) -> Tier {
    if state.cloud_tier.is_sticky_paid() || cfg.tiers_of(Tier::CloudFree).is_empty() {
        Tier::CloudPaid
    } else {
        Tier::CloudFree
    }
}

/// Classification result driving what, if anything, the queue worker does
/// next after an attempt finished with a non-`Ok` outcome.
#[derive(Debug, Clone)]
pub enum NextStep {
    /// Plan and run another attempt.
    Retry(Plan),
    /// No further attempts — the Request is done (successfully or not).
    Stop,
}

/// Decide the next step after an attempt finished. `local_transitions` and
/// `cloud_attempts` come from `Request::local_to_cloud_transitions` /
/// `Request::cloud_attempts` so this function stays pure and easy to test.
#[instrument(skip(state, cfg, ctx, health, usage), fields(?outcome, ?error_code, tier = %failed_plan.tier))]
#[allow(clippy::too_many_arguments)]
pub fn plan_next(
    state: &RouterState,
    cfg: &Config,
    ctx: &Context,
    failed_plan: &Plan,
    outcome: Outcome,
    error_code: Option<ErrorCode>,
    local_transitions: usize,
    cloud_attempts: usize,
    payload: &str,
    health: &HealthSupervisor,
    usage: &UsageLedger,
) -> anyhow::Result<NextStep> {
    if matches!(outcome, Outcome::Ok | Outcome::Cancelled) {
        return Ok(NextStep::Stop);
    }

    let transient = error_code.map(|e| e.is_transient()).unwrap_or(false);
    if !transient {
        return Ok(NextStep::Stop);
    }

    match failed_plan.tier {
        Tier::Local => {
            if local_transitions >= 1 {
                // Already transitioned once; a second local failure on a
                // fallback attempt is fatal rather than looping (§3 invariant:
                // at most one local→cloud transition per Request).
                return Ok(NextStep::Stop);
            }
            let entry_tier = cloud_entry_tier(state, cfg);
            let plan = build_plan(state, cfg, ctx, entry_tier, "local_failed_cloud_fallback", payload, health, usage)?;
            Ok(NextStep::Retry(plan))
        }
        Tier::CloudFree => {
            if cloud_attempts >= cfg.router.n_cloud_candidates {
                return Ok(NextStep::Stop);
            }
            let epoch_ms = chrono::Utc::now().timestamp_millis();
            if state.cloud_tier.try_autoswitch(epoch_ms) && !cfg.tiers_of(Tier::CloudPaid).is_empty() {
                let plan =
                    build_plan(state, cfg, ctx, Tier::CloudPaid, "cloud_free_exhausted_autoswitch_paid", payload, health, usage)?;
                Ok(NextStep::Retry(plan))
            } else {
                Ok(NextStep::Stop)
            }
        }
        Tier::CloudPaid => {
            if cloud_attempts >= cfg.router.n_cloud_candidates {
                return Ok(NextStep::Stop);
            }
            let plan = build_plan(state, cfg, ctx, Tier::CloudPaid, "cloud_paid_retry_next_candidate", payload, health, usage)?;
            Ok(NextStep::Retry(plan))
        }
    }
}

/// Lazily-built `cl100k_base` tokenizer, shared process-wide — BPE table
/// construction is expensive enough that doing it per-`build_plan` call
/// would show up in routing latency.
static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();

fn tokenizer() -> &'static CoreBPE {
    TOKENIZER.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base tokenizer tables are bundled"))
}

/// Resolve a concrete `Plan` for `tier`, choosing among configured
/// candidates by the Mood Engine's decayed per-(task_profile, model_id)
/// score (§4.4), falling back to config order when no candidate has a score
/// yet, and applying the confirm-expensive gate (§4.2).
///
/// Pure function of `Context` + `Policy` (via `ctx.policy_snapshot`) +
/// `HealthSnapshot` (via `health`) + `UsageLedger` (via `usage`) — it never
/// consults live backend state directly, so a Router caller can price and
/// preflight a tier without first spending a real `Attempt` on it.
#[allow(clippy::too_many_arguments)]
fn build_plan(
    state: &RouterState,
    cfg: &Config,
    ctx: &Context,
    tier: Tier,
    route_reason: &str,
    payload: &str,
    health: &HealthSupervisor,
    usage: &UsageLedger,
) -> anyhow::Result<Plan> {
    let candidates = cfg.tiers_of(tier);
    anyhow::ensure!(!candidates.is_empty(), "no tiers configured for kind `{tier}`");

    let task_profile = ctx.task_profile.unwrap_or(crate::domain::TaskProfile::General);
    let chosen = best_candidate(&state.mood, task_profile, &candidates).unwrap_or(candidates[0]);

    let confirm_required =
        matches!(tier, Tier::CloudPaid) && task_profile.requires_confirm_on_paid() && !ctx.confirm_expensive;

    let cost_estimate_usd = chosen.cost_per_1k_tokens_usd * (chosen.max_tokens as f64 / 1000.0);

    let prompt_tokens = tokenizer().encode_with_special_tokens(payload).len() as u64;
    let marginal_tokens = prompt_tokens + chosen.max_tokens as u64;
    let marginal_call_cost_usd = chosen.cost_per_1k_tokens_usd * (marginal_tokens as f64 / 1000.0);

    let mut reasons = vec![route_reason.to_string()];
    let mut warnings = Vec::new();

    let status = health.status(&chosen.backend);
    let can_run_now = status != HealthStatus::Down;
    match status {
        HealthStatus::Down => warnings.push(format!("backend `{}` is currently down", chosen.backend)),
        HealthStatus::Degraded => warnings.push(format!("backend `{}` is degraded", chosen.backend)),
        HealthStatus::Up => {}
    }

    if matches!(tier, Tier::CloudPaid) {
        let spend = usage.current_month_paid_spend_usd();
        if spend >= usage.high_threshold_usd {
            warnings.push(format!("cloud_paid spend ${spend:.2} has reached the configured cap"));
        } else if spend >= usage.warn_threshold_usd {
            warnings.push(format!("cloud_paid spend ${spend:.2} has crossed the warn threshold"));
        }
    }

    if confirm_required {
        reasons.push("confirm_expensive gate applies to this task profile on cloud_paid".to_string());
    }

    Ok(Plan {
        tier,
        model_id: chosen.model.clone(),
        max_tokens: chosen.max_tokens,
        stop_tokens: Vec::new(),
        reasoning_cap: 0,
        cost_estimate_usd,
        confirm_required,
        route_reason: route_reason.to_string(),
        reasons,
        warnings,
        marginal_call_cost_usd,
        can_run_now,
    })
}

/// Pick among same-kind candidates by the Mood Engine's decayed
/// per-(task_profile, model_id) score, breaking ties by config order.
pub fn best_candidate<'a>(
    mood: &MoodEngine,
    task_profile: crate::domain::TaskProfile,
    candidates: &'a [&'a TierConfig],
) -> Option<&'a TierConfig> {
    candidates
        .iter()
        .max_by_key(|t| mood.model_score(task_profile, &t.model))
        .copied()
}
