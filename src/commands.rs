//! Owner command parsing & dispatch — §4.6 "no HTTP analogue".
//!
//! Recognizes the `!policy`, `!ctx`, `!model`, `!ops`, `!mood`, `!reactions`
//! prefixes on an inbound `Event`'s payload. A message that doesn't match one
//! of these falls through to the normal Request pipeline unchanged — this
//! module never rejects ordinary chat text, only mutation attempts by a
//! non-owner once a prefix is recognized. Authorization is the caller's job
//! (`ingest::handle_event` checks `Context`'s resolved `Author` before
//! calling `dispatch`); parsing alone never touches `Config::is_owner`.

use crate::domain::ChatId;
use crate::policy::ForceMode;
use crate::state::AppState;

/// A parsed owner command, before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Policy(PolicyCommand),
    Ctx,
    Model(ModelCommand),
    Ops,
    Mood,
    Reactions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyCommand {
    Show,
    SetPersona(String),
    SetForceMode(ForceMode),
    SetConfirmExpensive(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelCommand {
    Catalog,
    SetForceMode(ForceMode),
}

/// Parse a raw message payload into a `Command`, if it starts with one of
/// the recognized owner-command prefixes. Returns `None` for everything
/// else, including a bare `!` that doesn't match a known prefix.
pub fn parse(payload: &str) -> Option<Command> {
    let mut parts = payload.trim().split_whitespace();
    let head = parts.next()?;
    let rest: Vec<&str> = parts.collect();

    match head {
        "!policy" => parse_policy(&rest).map(Command::Policy),
        "!ctx" => Some(Command::Ctx),
        "!model" => parse_model(&rest).map(Command::Model),
        "!ops" => Some(Command::Ops),
        "!mood" => Some(Command::Mood),
        "!reactions" => Some(Command::Reactions),
        _ => None,
    }
}

fn parse_policy(rest: &[&str]) -> Option<PolicyCommand> {
    match rest {
        [] => Some(PolicyCommand::Show),
        [head, tail @ ..] if *head == "persona" && !tail.is_empty() => Some(PolicyCommand::SetPersona(tail.join(" "))),
        [head, mode] if *head == "force_mode" => mode.parse().ok().map(PolicyCommand::SetForceMode),
        [head, "on"] if *head == "confirm_expensive" => Some(PolicyCommand::SetConfirmExpensive(true)),
        [head, "off"] if *head == "confirm_expensive" => Some(PolicyCommand::SetConfirmExpensive(false)),
        _ => None,
    }
}

fn parse_model(rest: &[&str]) -> Option<ModelCommand> {
    match rest {
        [] => Some(ModelCommand::Catalog),
        [mode] => mode.parse().ok().map(ModelCommand::SetForceMode),
        _ => None,
    }
}

/// Execute a parsed command against shared state and return the text reply
/// to send back to the chat. Only called once the caller has confirmed the
/// issuing author is owner.
pub async fn dispatch(state: &AppState, chat_id: &ChatId, command: Command) -> String {
    match command {
        Command::Policy(cmd) => dispatch_policy(state, chat_id, cmd).await,
        Command::Ctx => dispatch_ctx(state, chat_id).await,
        Command::Model(cmd) => dispatch_model(state, chat_id, cmd).await,
        Command::Ops => dispatch_ops(state).await,
        Command::Mood => dispatch_mood(state, chat_id),
        Command::Reactions => dispatch_reactions(state).await,
    }
}

async fn dispatch_policy(state: &AppState, chat_id: &ChatId, cmd: PolicyCommand) -> String {
    match cmd {
        PolicyCommand::Show => {
            let snap = state.policy.resolve(chat_id).await;
            format!(
                "persona={} force_mode={:?} confirm_expensive_default={}",
                snap.persona, snap.force_mode, snap.confirm_expensive_default
            )
        }
        PolicyCommand::SetPersona(persona) => {
            state.policy.set_persona(chat_id, persona.clone()).await;
            format!("persona set to `{persona}`")
        }
        PolicyCommand::SetForceMode(mode) => {
            state.policy.set_force_mode(chat_id, mode).await;
            format!("force_mode set to {mode:?}")
        }
        PolicyCommand::SetConfirmExpensive(value) => {
            state.policy.set_confirm_expensive_default(chat_id, value).await;
            format!("confirm_expensive_default set to {value}")
        }
    }
}

async fn dispatch_ctx(state: &AppState, chat_id: &ChatId) -> String {
    let snap = state.policy.resolve(chat_id).await;
    let mood = state.mood.chat_mood(chat_id);
    format!("persona={} force_mode={:?} mood={mood:?}", snap.persona, snap.force_mode)
}

async fn dispatch_model(state: &AppState, chat_id: &ChatId, cmd: ModelCommand) -> String {
    match cmd {
        ModelCommand::Catalog => {
            let cfg = state.router.config().await;
            let lines: Vec<String> = cfg.tiers.iter().map(|t| format!("{} ({}/{})", t.name, t.kind, t.model)).collect();
            if lines.is_empty() { "no tiers configured".to_string() } else { lines.join("\n") }
        }
        ModelCommand::SetForceMode(mode) => {
            state.policy.set_force_mode(chat_id, mode).await;
            format!("force_mode set to {mode:?}")
        }
    }
}

async fn dispatch_ops(state: &AppState) -> String {
    let spend = state.usage.current_month_paid_spend_usd();
    let free_calls = state.usage.today_free_cloud_calls();
    let active = state.alerts.active();
    let alert_lines = if active.is_empty() {
        "no active alerts".to_string()
    } else {
        active.iter().map(|a| format!("[{:?}] {}", a.severity, a.message)).collect::<Vec<_>>().join("\n")
    };
    format!("cloud_paid spend this month: ${spend:.2}\ncloud_free calls today: {free_calls} / {}\n{alert_lines}", state.usage.free_cloud_daily_cap)
}

fn dispatch_mood(state: &AppState, chat_id: &ChatId) -> String {
    format!("chat mood: {:?}", state.mood.chat_mood(chat_id))
}

async fn dispatch_reactions(state: &AppState) -> String {
    let cfg = state.router.config().await;
    if cfg.gateway.auto_reactions_enabled {
        format!("auto-reactions: on (every {} messages)", cfg.gateway.auto_reaction_every_n)
    } else {
        "auto-reactions: off".to_string()
    }
}
