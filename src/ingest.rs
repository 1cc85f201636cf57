//! Context Builder & event ingestion — §2, §4.6.
//!
//! Turns a transport-delivered `Event` into either an owner-command reply
//! (answered immediately, never becoming a `Request`) or a `Request`
//! submitted to the Chat Work Queue with a `Context` frozen at the moment of
//! ingestion: author provenance resolved via the transport (never inferred
//! from the payload), best-effort reply/forward provenance, and the mood and
//! policy snapshots as they stood right then (§4.6 "a later Policy or Mood
//! mutation must not affect an in-flight Request").

use tracing::warn;

use crate::commands;
use crate::domain::{Author, Context, Event, Provenance, Request, TaskProfile};
use crate::error::ErrorCode;
use crate::state::AppState;
use crate::transport::ChatTransport;

/// Handle one inbound `Event`: dispatch it as an owner command if it parses
/// as one, otherwise build its `Context` and submit it to the queue. Errors
/// are this function's own (transport/context-building failures); a
/// `Request` that later fails is the Engine's problem, not this one's.
pub async fn handle_event(transport: &dyn ChatTransport, state: &AppState, event: Event) -> anyhow::Result<()> {
    let resolved = transport.resolve_author(&event.author_id).await?;

    if let Some(command) = commands::parse(&event.payload) {
        let reply = if resolved.is_owner {
            commands::dispatch(state, &event.chat_id, command).await
        } else {
            ErrorCode::BlockedNotOwner.user_message().to_string()
        };
        return transport.send_message(&event.chat_id, &reply).await;
    }

    if !event.requires_reply() {
        return Ok(());
    }

    let author = Author { principal_id: resolved.principal_id, is_owner: resolved.is_owner };
    let context = build_context(transport, state, &event, author).await?;

    let sla_sec = state.router.config().await.gateway.sla_sec;
    let request = Request::new(event, context, chrono::Duration::seconds(sla_sec as i64));

    let (done_tx, _done_rx) = tokio::sync::oneshot::channel();
    state.queue.submit_awaitable(request, done_tx).await?;
    Ok(())
}

/// Resolve an `Event`'s `Context`. Provenance resolution is best-effort: a
/// transport that can't look up a historical message just logs and omits
/// that field rather than failing the whole build.
async fn build_context(transport: &dyn ChatTransport, state: &AppState, event: &Event, author: Author) -> anyhow::Result<Context> {
    let reply_to = match &event.reply_to {
        Some(message_id) => resolve_reply_provenance(transport, event, message_id).await,
        None => None,
    };

    let forward_from = match &event.forward_from {
        Some((forward_author_id, message_id)) => resolve_forward_provenance(transport, forward_author_id, message_id).await,
        None => None,
    };

    let mood_snapshot = state.mood.chat_mood(&event.chat_id);
    let policy_snapshot = state.policy.resolve(&event.chat_id).await;

    Ok(Context {
        persona: policy_snapshot.persona.clone(),
        confirm_expensive: policy_snapshot.confirm_expensive_default,
        task_profile: classify_task(&event.payload),
        author,
        reply_to,
        forward_from,
        mood_snapshot,
        policy_snapshot,
    })
}

async fn resolve_reply_provenance(transport: &dyn ChatTransport, event: &Event, message_id: &str) -> Option<Provenance> {
    match transport.resolve_message_author(&event.chat_id, message_id).await {
        Ok(resolved) => Some(Provenance {
            message_id: message_id.to_string(),
            author: Author { principal_id: resolved.principal_id, is_owner: resolved.is_owner },
        }),
        Err(e) => {
            warn!(chat_id = %event.chat_id, message_id, error = %e, "could not resolve reply provenance");
            None
        }
    }
}

async fn resolve_forward_provenance(transport: &dyn ChatTransport, author_id: &str, message_id: &str) -> Option<Provenance> {
    match transport.resolve_author(author_id).await {
        Ok(resolved) => Some(Provenance {
            message_id: message_id.to_string(),
            author: Author { principal_id: resolved.principal_id, is_owner: resolved.is_owner },
        }),
        Err(e) => {
            warn!(message_id, error = %e, "could not resolve forward provenance");
            None
        }
    }
}

/// Coarse keyword classification of a payload into a `TaskProfile`, used by
/// the confirm-expensive gate and the Mood Engine's tie-breaking lookup.
/// Deliberately simple — a misclassification only costs a tie-break or an
/// extra confirm prompt, never correctness of the reply itself.
fn classify_task(payload: &str) -> Option<TaskProfile> {
    let lower = payload.to_lowercase();
    if lower.contains("cve") || lower.contains("exploit") || lower.contains("vulnerab") {
        Some(TaskProfile::Security)
    } else if lower.contains("kubectl") || lower.contains("terraform") || lower.contains("deploy") {
        Some(TaskProfile::Infra)
    } else if lower.contains("review this") || lower.contains("code review") {
        Some(TaskProfile::Review)
    } else if lower.contains("think step by step") || lower.contains("prove that") {
        Some(TaskProfile::DeepReasoning)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;
    use crate::state::test_app_state;
    use crate::transport::LoopbackTransport;

    #[tokio::test]
    async fn owner_command_never_reaches_the_queue() {
        let state = test_app_state("CHATLOOM_TEST_INGEST_OWNER_CMD");
        let transport = LoopbackTransport::new().with_owner("owner-1");
        let event = Event::new("c1", "m1", "owner-1", EventKind::Text, "!mood");

        handle_event(&transport, &state, event).await.unwrap();

        assert_eq!(state.queue.active_chats().await, 0);
        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("mood"));
    }

    #[tokio::test]
    async fn non_owner_command_attempt_is_rejected() {
        let state = test_app_state("CHATLOOM_TEST_INGEST_NON_OWNER_CMD");
        let transport = LoopbackTransport::new();
        let event = Event::new("c1", "m1", "random-user", EventKind::Text, "!policy persona evil");

        handle_event(&transport, &state, event).await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, ErrorCode::BlockedNotOwner.user_message());

        let snap = state.policy.resolve(&crate::domain::ChatId::from("c1")).await;
        assert_eq!(snap.persona, "default");
    }

    #[tokio::test]
    async fn reaction_event_is_dropped_without_submitting() {
        let state = test_app_state("CHATLOOM_TEST_INGEST_REACTION");
        let transport = LoopbackTransport::new();
        let event = Event::new("c1", "m1", "u1", EventKind::Reaction, "👍");

        handle_event(&transport, &state, event).await.unwrap();

        assert_eq!(state.queue.active_chats().await, 0);
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn ordinary_text_event_reaches_the_queue() {
        let state = test_app_state("CHATLOOM_TEST_INGEST_TEXT");
        let transport = LoopbackTransport::new();
        let event = Event::new("c1", "m1", "u1", EventKind::Text, "hello there");

        handle_event(&transport, &state, event).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn reply_provenance_is_resolved_when_available() {
        let state = test_app_state("CHATLOOM_TEST_INGEST_REPLY_PROV");
        let transport = LoopbackTransport::new().with_message("c1", "m0", "u-original");
        let mut event = Event::new("c1", "m1", "u1", EventKind::Text, "following up");
        event.reply_to = Some("m0".to_string());

        let resolved = transport.resolve_author("u1").await.unwrap();
        let author = Author { principal_id: resolved.principal_id, is_owner: resolved.is_owner };
        let ctx = build_context(&transport, &state, &event, author).await.unwrap();

        let provenance = ctx.reply_to.expect("reply provenance should resolve");
        assert_eq!(provenance.author.principal_id, "u-original");
    }

    #[tokio::test]
    async fn reply_provenance_is_omitted_when_unresolvable() {
        let state = test_app_state("CHATLOOM_TEST_INGEST_REPLY_PROV_MISSING");
        let transport = LoopbackTransport::new();
        let mut event = Event::new("c1", "m1", "u1", EventKind::Text, "following up");
        event.reply_to = Some("unknown-message".to_string());

        let resolved = transport.resolve_author("u1").await.unwrap();
        let author = Author { principal_id: resolved.principal_id, is_owner: resolved.is_owner };
        let ctx = build_context(&transport, &state, &event, author).await.unwrap();

        assert!(ctx.reply_to.is_none());
    }

    #[test]
    fn classify_task_recognizes_security_keywords() {
        assert_eq!(classify_task("any known CVE for this package?"), Some(TaskProfile::Security));
    }

    #[test]
    fn classify_task_falls_back_to_none_for_general_chat() {
        assert_eq!(classify_task("what's for lunch"), None);
    }
}
