//! Core data model shared by every component — §3 of the spec.
//!
//! These types are intentionally dumb: no component reaches into another's
//! state through them. A `Request` is owned by exactly one `ChatWorker` for
//! its entire life; everything else is handed around as an owned value or a
//! cheap snapshot, never a shared mutable reference.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::policy::{MoodTone, PolicySnapshot};

/// Stable identifier of a conversation. Partition key everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of inbound chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    Voice,
    Photo,
    Command,
    Reaction,
}

/// An immutable inbound chat event. Discarded once the terminal `Attempt` for
/// its derived `Request` (if any) is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub chat_id: ChatId,
    pub message_id: String,
    pub author_id: String,
    pub kind: EventKind,
    pub payload: String,
    pub received_at: DateTime<Utc>,
    /// `message_id` of the message this one replies to, if any.
    pub reply_to: Option<String>,
    /// `(author_id, message_id)` of the message this one forwards, if any.
    pub forward_from: Option<(String, String)>,
}

impl Event {
    pub fn new(chat_id: impl Into<ChatId>, message_id: impl Into<String>, author_id: impl Into<String>, kind: EventKind, payload: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            message_id: message_id.into(),
            author_id: author_id.into(),
            kind,
            payload: payload.into(),
            received_at: Utc::now(),
            reply_to: None,
            forward_from: None,
        }
    }

    /// Does this event warrant a reply at all? Reactions never do; everything
    /// else does (commands are intercepted by the Policy & Context Store
    /// before reaching the queue, but the queue itself doesn't need to know
    /// that — it only decides whether an `Event` becomes a `Request`).
    pub fn requires_reply(&self) -> bool {
        !matches!(self.kind, EventKind::Reaction)
    }
}

/// Resolved provenance of a message's author, built by the Context Builder
/// from the transport-provided principal — never from text heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub principal_id: String,
    pub is_owner: bool,
}

/// Provenance of a quoted/forwarded message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub message_id: String,
    pub author: Author,
}

/// Immutable per-Request context, built once and frozen for the Request's
/// lifetime. A Policy or Mood mutation observed after this snapshot is taken
/// must not affect the Request (§5 ordering guarantee).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub author: Author,
    pub reply_to: Option<Provenance>,
    pub forward_from: Option<Provenance>,
    pub mood_snapshot: MoodTone,
    pub policy_snapshot: PolicySnapshot,
    pub persona: String,
    /// Explicit opt-in carried from the transport or HTTP control surface,
    /// required by the confirm-expensive gate (§4.2).
    pub confirm_expensive: bool,
    /// Coarse task classification used for tie-breaking and the
    /// confirm-expensive gate. `None` means "general" — never requires
    /// confirmation regardless of tier.
    pub task_profile: Option<TaskProfile>,
}

/// Coarse classification of what a Request is asking for. Drives the
/// confirm-expensive gate and the Router's tie-breaking feedback lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskProfile {
    Security,
    Infra,
    Review,
    DeepReasoning,
    General,
}

impl TaskProfile {
    /// Profiles that require `confirm_expensive=true` before landing on a
    /// paid tier (§4.2 "Confirm-expensive gate").
    pub fn requires_confirm_on_paid(self) -> bool {
        matches!(
            self,
            TaskProfile::Security | TaskProfile::Infra | TaskProfile::Review | TaskProfile::DeepReasoning
        )
    }
}

/// Routing tier. Ordered cheapest-first for display purposes only — the
/// Router never iterates tiers as a ladder the way the teacher's `TierConfig`
/// list did; tier choice is driven by `force_mode` and failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    CloudFree,
    CloudPaid,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Local => "local",
            Tier::CloudFree => "cloud_free",
            Tier::CloudPaid => "cloud_paid",
        })
    }
}

impl Tier {
    pub fn is_cloud(self) -> bool {
        matches!(self, Tier::CloudFree | Tier::CloudPaid)
    }
}

/// An immutable routing decision for one `Attempt`. Recomputed on fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub tier: Tier,
    pub model_id: String,
    pub max_tokens: u32,
    pub stop_tokens: Vec<String>,
    pub reasoning_cap: u32,
    pub cost_estimate_usd: f64,
    pub confirm_required: bool,
    /// Human-readable route rationale, e.g. `"local_failed_cloud_fallback"`.
    pub route_reason: String,
    /// Why this tier/model was chosen — append-only narration, not parsed by
    /// anything (§4.2 preflight).
    pub reasons: Vec<String>,
    /// Non-fatal concerns surfaced alongside the plan — degraded backend,
    /// approaching spend cap, etc. Advisory only.
    pub warnings: Vec<String>,
    /// Estimated cost in USD of the next attempt under this plan, from the
    /// tokenizer-based estimate over the Request's payload plus the tier's
    /// `max_tokens` ceiling.
    pub marginal_call_cost_usd: f64,
    /// Preflight verdict: `false` means the Engine must not spend an Attempt
    /// on this plan (e.g. the resolved backend is currently DOWN) and should
    /// ask the Router for the next step instead, without counting this plan
    /// against the fallback budget (§4.2, §4.5).
    pub can_run_now: bool,
}

/// Terminal (or cancelling) outcome of one `Attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Transient,
    Fatal,
    Timeout,
    Loop,
    Cancelled,
}

/// One execution of a `Plan` against a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub plan: Plan,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub error_code: Option<ErrorCode>,
    pub route_reason: String,
}

impl Attempt {
    pub fn started(plan: Plan) -> Self {
        let route_reason = plan.route_reason.clone();
        Self {
            plan,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            bytes_in: 0,
            bytes_out: 0,
            error_code: None,
            route_reason,
        }
    }

    pub fn finish(&mut self, outcome: Outcome, error_code: Option<ErrorCode>, bytes_in: u64, bytes_out: u64) {
        self.ended_at = Some(Utc::now());
        self.outcome = Some(outcome);
        self.error_code = error_code;
        self.bytes_in = bytes_in;
        self.bytes_out = bytes_out;
    }

    pub fn latency_ms(&self) -> u64 {
        match self.ended_at {
            Some(end) => (end - self.started_at).num_milliseconds().max(0) as u64,
            None => 0,
        }
    }
}

/// State machine label for a `Request`, tracked informally via `attempts` +
/// `terminal_outcome` rather than as its own field — the state is always
/// derivable from the attempt log, matching the teacher's preference for
/// deriving status from data rather than maintaining a parallel enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Planned,
    Running,
    FallbackPlanned,
    Ok,
    Fatal,
    LoopAborted,
    SlaAborted,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Ok
                | RequestState::Fatal
                | RequestState::LoopAborted
                | RequestState::SlaAborted
                | RequestState::Cancelled
        )
    }
}

/// One Request per Event that requires a reply. Owned by exactly one
/// ChatWorker for its entire life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub chat_id: ChatId,
    pub event: Event,
    pub context: Context,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub attempts: Vec<Attempt>,
    pub state: RequestState,
}

impl Request {
    pub fn new(event: Event, context: Context, sla: chrono::Duration) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            chat_id: event.chat_id.clone(),
            event,
            context,
            deadline: created_at + sla,
            created_at,
            attempts: Vec::new(),
            state: RequestState::Planned,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.deadline
    }

    /// Number of local→cloud transitions already performed. Per the
    /// invariant in §3, this is at most 1.
    pub fn local_to_cloud_transitions(&self) -> usize {
        self.attempts
            .windows(2)
            .filter(|w| w[0].plan.tier == Tier::Local && w[1].plan.tier.is_cloud())
            .count()
    }

    /// Number of cloud attempts already made (used against `N_CLOUD_CANDIDATES`).
    pub fn cloud_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| a.plan.tier.is_cloud()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicySnapshot;

    fn ctx() -> Context {
        Context {
            author: Author { principal_id: "u1".into(), is_owner: true },
            reply_to: None,
            forward_from: None,
            mood_snapshot: MoodTone::Neutral,
            policy_snapshot: PolicySnapshot::default(),
            persona: "default".into(),
            confirm_expensive: false,
            task_profile: None,
        }
    }

    #[test]
    fn reaction_events_do_not_require_reply() {
        let e = Event::new("c1", "m1", "u1", EventKind::Reaction, "👍");
        assert!(!e.requires_reply());
    }

    #[test]
    fn text_events_require_reply() {
        let e = Event::new("c1", "m1", "u1", EventKind::Text, "hi");
        assert!(e.requires_reply());
    }

    #[test]
    fn local_to_cloud_transition_counted_once() {
        let e = Event::new("c1", "m1", "u1", EventKind::Text, "hi");
        let mut r = Request::new(e, ctx(), chrono::Duration::seconds(90));

        let local_plan = Plan {
            tier: Tier::Local,
            model_id: "local-1".into(),
            max_tokens: 100,
            stop_tokens: vec![],
            reasoning_cap: 100,
            cost_estimate_usd: 0.0,
            confirm_required: false,
            route_reason: "auto".into(),
            reasons: vec![],
            warnings: vec![],
            marginal_call_cost_usd: 0.0,
            can_run_now: true,
        };
        let mut cloud_plan = local_plan.clone();
        cloud_plan.tier = Tier::CloudFree;
        cloud_plan.route_reason = "local_failed_cloud_fallback".into();

        r.attempts.push(Attempt::started(local_plan));
        r.attempts.push(Attempt::started(cloud_plan));

        assert_eq!(r.local_to_cloud_transitions(), 1);
        assert_eq!(r.cloud_attempts(), 1);
    }

    #[test]
    fn request_deadline_respects_sla() {
        let e = Event::new("c1", "m1", "u1", EventKind::Text, "hi");
        let r = Request::new(e, ctx(), chrono::Duration::seconds(0));
        assert!(r.is_expired());
    }
}
