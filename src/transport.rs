//! Chat transport boundary.
//!
//! The orchestrator is transport-agnostic: it accepts `Event`s and emits
//! replies through this trait, and never talks to a chat platform's wire
//! protocol directly. No concrete transport (Telegram, Matrix, etc.) is part
//! of this crate — wiring one up is left to the embedding application
//! (Non-goal, SPEC_FULL.md §"Non-goals"). What lives here is the seam itself
//! and the test doubles used to exercise the rest of the system without one.

use async_trait::async_trait;

use crate::domain::{Author, ChatId};

/// A reply destined for a chat, as the orchestrator sees it — no
/// platform-specific formatting (Markdown dialect, attachment encoding)
/// is assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingReply {
    pub chat_id: ChatId,
    pub text: String,
    /// Set when the reply was cut short by a guardrail or SLA abort —
    /// callers may want to render this differently (e.g. an italic note).
    pub truncated: bool,
}

/// An `Author` as resolved by the transport from its own notion of identity
/// (platform user id, display name) — the Context Builder turns this into
/// the domain's `Author`/`Provenance` types, never the other way around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAuthor {
    pub principal_id: String,
    pub display_name: Option<String>,
    pub is_owner: bool,
}

/// Sink for replies and status updates produced by the Request Lifecycle
/// Engine, and source of author-resolution facts the Context Builder needs.
/// Implementations own the actual network call to a chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Reply to the `Request`'s originating message — the common path every
    /// finished `Request` goes through.
    async fn send_reply(&self, reply: OutgoingReply) -> anyhow::Result<()>;

    /// Send a standalone message not tied to a specific `Request` (owner
    /// command replies, ops alerts pushed proactively).
    async fn send_message(&self, chat_id: &ChatId, text: &str) -> anyhow::Result<()>;

    /// Edit a previously sent message in place, e.g. to turn a streaming
    /// "thinking…" placeholder into the final reply. Transports that can't
    /// edit should fall back to a no-op rather than erroring.
    async fn edit_message(&self, chat_id: &ChatId, message_id: &str, text: &str) -> anyhow::Result<()>;

    /// Best-effort typing/progress indicator; transports that don't support
    /// one can make this a no-op rather than an error.
    async fn send_typing(&self, chat_id: &ChatId) -> anyhow::Result<()>;

    /// Add a reaction emoji to a message — used by the auto-reaction rate
    /// limiter (§4.4) and by owner `!reactions` acknowledgements.
    async fn add_reaction(&self, chat_id: &ChatId, message_id: &str, emoji: &str) -> anyhow::Result<()>;

    /// Resolve `author_id` (a raw platform user id) into a `ResolvedAuthor`,
    /// including owner status — the Context Builder never infers ownership
    /// from the `Event` itself (§4.6).
    async fn resolve_author(&self, author_id: &str) -> anyhow::Result<ResolvedAuthor>;

    /// Resolve the author of a historical message in `chat_id` by its
    /// `message_id` — the capability the Context Builder needs to turn an
    /// `Event::reply_to` into a `Provenance` (forward provenance already
    /// carries its author id directly). Transports that can't look up old
    /// messages should return an error rather than guessing.
    async fn resolve_message_author(&self, chat_id: &ChatId, message_id: &str) -> anyhow::Result<ResolvedAuthor>;
}

/// Discards everything. Useful for load paths where replies aren't observed
/// (benchmarks, dry runs).
pub struct NullTransport;

#[async_trait]
impl ChatTransport for NullTransport {
    async fn send_reply(&self, _reply: OutgoingReply) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_message(&self, _chat_id: &ChatId, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn edit_message(&self, _chat_id: &ChatId, _message_id: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_typing(&self, _chat_id: &ChatId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn add_reaction(&self, _chat_id: &ChatId, _message_id: &str, _emoji: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn resolve_author(&self, author_id: &str) -> anyhow::Result<ResolvedAuthor> {
        Ok(ResolvedAuthor { principal_id: author_id.to_string(), display_name: None, is_owner: false })
    }

    async fn resolve_message_author(&self, _chat_id: &ChatId, _message_id: &str) -> anyhow::Result<ResolvedAuthor> {
        anyhow::bail!("NullTransport cannot resolve historical messages")
    }
}

/// Records everything sent to it in order, for assertions in tests that
/// exercise the queue/router/streaming pipeline end to end without a real
/// chat platform.
pub struct LoopbackTransport {
    sent: tokio::sync::Mutex<Vec<OutgoingReply>>,
    reactions: tokio::sync::Mutex<Vec<(ChatId, String, String)>>,
    /// Principal ids this loopback treats as owner — set by tests that need
    /// `resolve_author` to report `is_owner: true`.
    owners: std::collections::HashSet<String>,
    /// `(chat_id, message_id) -> author_id`, for `resolve_message_author`.
    messages: std::collections::HashMap<(ChatId, String), String>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            sent: tokio::sync::Mutex::new(Vec::new()),
            reactions: tokio::sync::Mutex::new(Vec::new()),
            owners: std::collections::HashSet::new(),
            messages: std::collections::HashMap::new(),
        }
    }

    pub fn with_owner(mut self, principal_id: impl Into<String>) -> Self {
        self.owners.insert(principal_id.into());
        self
    }

    /// Register a historical message's author, so `resolve_message_author`
    /// can answer a reply-provenance lookup in tests.
    pub fn with_message(mut self, chat_id: impl Into<ChatId>, message_id: impl Into<String>, author_id: impl Into<String>) -> Self {
        self.messages.insert((chat_id.into(), message_id.into()), author_id.into());
        self
    }

    pub async fn sent(&self) -> Vec<OutgoingReply> {
        self.sent.lock().await.clone()
    }

    pub async fn reactions(&self) -> Vec<(ChatId, String, String)> {
        self.reactions.lock().await.clone()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for LoopbackTransport {
    async fn send_reply(&self, reply: OutgoingReply) -> anyhow::Result<()> {
        self.sent.lock().await.push(reply);
        Ok(())
    }

    async fn send_message(&self, chat_id: &ChatId, text: &str) -> anyhow::Result<()> {
        self.sent.lock().await.push(OutgoingReply { chat_id: chat_id.clone(), text: text.to_string(), truncated: false });
        Ok(())
    }

    async fn edit_message(&self, _chat_id: &ChatId, _message_id: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_typing(&self, _chat_id: &ChatId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn add_reaction(&self, chat_id: &ChatId, message_id: &str, emoji: &str) -> anyhow::Result<()> {
        self.reactions.lock().await.push((chat_id.clone(), message_id.to_string(), emoji.to_string()));
        Ok(())
    }

    async fn resolve_author(&self, author_id: &str) -> anyhow::Result<ResolvedAuthor> {
        Ok(ResolvedAuthor {
            principal_id: author_id.to_string(),
            display_name: None,
            is_owner: self.owners.contains(author_id),
        })
    }

    async fn resolve_message_author(&self, chat_id: &ChatId, message_id: &str) -> anyhow::Result<ResolvedAuthor> {
        let author_id = self
            .messages
            .get(&(chat_id.clone(), message_id.to_string()))
            .ok_or_else(|| anyhow::anyhow!("no such message `{message_id}` in loopback history"))?;
        self.resolve_author(author_id).await
    }
}

/// Build a domain `Author` from a transport's resolution — never from text
/// heuristics on the `Event` payload (§4.6).
pub async fn resolve_author(transport: &dyn ChatTransport, author_id: &str) -> anyhow::Result<Author> {
    let resolved = transport.resolve_author(author_id).await?;
    Ok(Author { principal_id: resolved.principal_id, is_owner: resolved.is_owner })
}
