//! Policy & Context Store — §4.6.
//!
//! Holds the small amount of per-chat state that isn't part of a `Request`'s
//! own lifecycle: persona overrides, owner-issued routing preferences, and
//! the mood tone the Reaction & Mood Engine last computed. Generalizes the
//! teacher's `[[clients]]` → profile lookup from a static, config-loaded
//! table to a runtime, TTL-bound store keyed by `ChatId` instead of API key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::domain::ChatId;

/// Coarse mood label surfaced to the model as a system-prompt hint. Mirrors
/// the Reaction & Mood Engine's decayed score buckets (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MoodTone {
    Warm,
    #[default]
    Neutral,
    Curt,
}

/// Per-chat policy, resolved by `PolicyStore::resolve` and frozen into a
/// `Context` at Request-build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub persona: String,
    pub force_mode: ForceMode,
    pub confirm_expensive_default: bool,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            persona: "default".to_string(),
            force_mode: ForceMode::Auto,
            confirm_expensive_default: false,
        }
    }
}

/// Owner-controlled override of the Model Router's tier selection (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForceMode {
    #[default]
    Auto,
    Local,
    Cloud,
}

impl std::str::FromStr for ForceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ForceMode::Auto),
            "local" => Ok(ForceMode::Local),
            "cloud" => Ok(ForceMode::Cloud),
            other => Err(format!("unknown force_mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
struct PolicyEntry {
    snapshot: PolicySnapshot,
    expires_at: Instant,
}

/// Process-wide, TTL-bound policy table. One entry per `ChatId`; entries not
/// touched within `ttl` are treated as expired and fall back to defaults on
/// next read, and are swept out lazily by `sweep_expired`.
pub struct PolicyStore {
    entries: RwLock<HashMap<ChatId, PolicyEntry>>,
    ttl: Duration,
}

impl PolicyStore {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    /// Resolve the effective policy for a chat, falling back to defaults if
    /// no entry exists or the entry has expired.
    pub async fn resolve(&self, chat_id: &ChatId) -> PolicySnapshot {
        let entries = self.entries.read().await;
        match entries.get(chat_id) {
            Some(entry) if entry.expires_at > Instant::now() => entry.snapshot.clone(),
            _ => PolicySnapshot::default(),
        }
    }

    pub async fn set_persona(&self, chat_id: &ChatId, persona: String) {
        self.update(chat_id, |s| s.persona = persona).await;
    }

    pub async fn set_force_mode(&self, chat_id: &ChatId, mode: ForceMode) {
        self.update(chat_id, |s| s.force_mode = mode).await;
    }

    pub async fn set_confirm_expensive_default(&self, chat_id: &ChatId, value: bool) {
        self.update(chat_id, |s| s.confirm_expensive_default = value).await;
    }

    async fn update(&self, chat_id: &ChatId, f: impl FnOnce(&mut PolicySnapshot)) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(chat_id.clone()).or_insert_with(|| PolicyEntry {
            snapshot: PolicySnapshot::default(),
            expires_at: Instant::now() + self.ttl,
        });
        f(&mut entry.snapshot);
        entry.expires_at = Instant::now() + self.ttl;
    }

    /// Drop entries past their TTL. Called from the same background task
    /// that reaps idle chat workers (§4.1).
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unset_chat_resolves_to_defaults() {
        let store = PolicyStore::new(Duration::from_secs(60));
        let snap = store.resolve(&ChatId::from("c1")).await;
        assert_eq!(snap.persona, "default");
        assert_eq!(snap.force_mode, ForceMode::Auto);
    }

    #[tokio::test]
    async fn set_persona_persists_until_ttl() {
        let store = PolicyStore::new(Duration::from_secs(60));
        let chat = ChatId::from("c1");
        store.set_persona(&chat, "grumpy".to_string()).await;
        let snap = store.resolve(&chat).await;
        assert_eq!(snap.persona, "grumpy");
    }

    #[tokio::test]
    async fn expired_entry_falls_back_to_defaults() {
        let store = PolicyStore::new(Duration::from_millis(10));
        let chat = ChatId::from("c1");
        store.set_force_mode(&chat, ForceMode::Local).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let snap = store.resolve(&chat).await;
        assert_eq!(snap.force_mode, ForceMode::Auto);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries_only() {
        let store = PolicyStore::new(Duration::from_millis(10));
        store.set_persona(&ChatId::from("c1"), "a".to_string()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set_persona(&ChatId::from("c2"), "b".to_string()).await;
        let removed = store.sweep_expired().await;
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
    }
}
