//! Reaction & Mood Engine — §4.4.
//!
//! Tracks two things, both advisory and never gating: a per-chat mood tone
//! derived from recent reactions, and a weak per-`(task_profile, model_id)`
//! feedback score the Router may use as a tie-breaker among otherwise-equal
//! cloud candidates. Grounded on the rate limiter's per-key `DashMap` bucket
//! pattern (`api::rate_limit`) — same shape, different payload and decay.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::domain::{ChatId, TaskProfile};
use crate::policy::MoodTone;

/// A single reaction observed on a sent reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Positive,
    Negative,
}

struct MoodState {
    /// Exponentially-decayed score in [-100, 100]; positive reactions push
    /// it up, negative push it down, and it decays toward 0 over time.
    score: AtomicI64,
    last_update: std::sync::Mutex<Instant>,
}

impl MoodState {
    fn fresh() -> Self {
        Self {
            score: AtomicI64::new(0),
            last_update: std::sync::Mutex::new(Instant::now()),
        }
    }
}

/// Per-chat mood tracking plus per-(task_profile, model_id) weak feedback
/// scoring. All mutation is lock-free per key via `DashMap`; score decay is
/// applied lazily on read/write, not by a background task.
pub struct MoodEngine {
    chat_mood: DashMap<ChatId, MoodState>,
    model_feedback: DashMap<(TaskProfile, String), MoodState>,
    half_life: Duration,
    /// Messages seen since the last auto-reaction per chat, for the ≤1-per-N
    /// rate limiter (§4.4).
    reaction_counters: DashMap<ChatId, u32>,
}

const POSITIVE_DELTA: i64 = 15;
const NEGATIVE_DELTA: i64 = 25;
const WARM_THRESHOLD: i64 = 20;
const CURT_THRESHOLD: i64 = -20;

impl MoodEngine {
    pub fn new(half_life: Duration) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            chat_mood: DashMap::new(),
            model_feedback: DashMap::new(),
            half_life,
            reaction_counters: DashMap::new(),
        })
    }

    /// Rate-limited gate for automatic reactions: at most one auto-reaction
    /// per `every_n` messages in a chat, with `enabled` acting as a hard kill
    /// switch (§4.4). Every call advances the per-chat counter regardless of
    /// the verdict, so the limiter tracks messages seen, not reactions sent.
    pub fn should_auto_react(&self, chat_id: &ChatId, enabled: bool, every_n: u32) -> bool {
        if !enabled || every_n == 0 {
            return false;
        }
        let mut count = self.reaction_counters.entry(chat_id.clone()).or_insert(0);
        *count += 1;
        if *count >= every_n {
            *count = 0;
            true
        } else {
            false
        }
    }

    pub fn record_chat_reaction(&self, chat_id: &ChatId, reaction: Reaction) {
        let entry = self.chat_mood.entry(chat_id.clone()).or_insert_with(MoodState::fresh);
        Self::apply(&entry, reaction, self.half_life);
    }

    pub fn record_model_feedback(&self, profile: TaskProfile, model_id: &str, reaction: Reaction) {
        let key = (profile, model_id.to_string());
        let entry = self.model_feedback.entry(key).or_insert_with(MoodState::fresh);
        Self::apply(&entry, reaction, self.half_life);
    }

    fn apply(state: &MoodState, reaction: Reaction, half_life: Duration) {
        let mut last = state.last_update.lock().expect("mood mutex poisoned");
        let elapsed = last.elapsed();
        *last = Instant::now();
        drop(last);

        let decayed = decay(state.score.load(Ordering::Relaxed), elapsed, half_life);
        let delta = match reaction {
            Reaction::Positive => POSITIVE_DELTA,
            Reaction::Negative => -NEGATIVE_DELTA,
        };
        let updated = (decayed + delta).clamp(-100, 100);
        state.score.store(updated, Ordering::Relaxed);
    }

    pub fn chat_mood(&self, chat_id: &ChatId) -> MoodTone {
        match self.chat_mood.get(chat_id) {
            Some(entry) => {
                let score = decay(
                    entry.score.load(Ordering::Relaxed),
                    entry.last_update.lock().expect("mood mutex poisoned").elapsed(),
                    self.half_life,
                );
                tone_for(score)
            }
            None => MoodTone::Neutral,
        }
    }

    /// Weak tie-breaking score for a model within a task profile, in
    /// [-100, 100]. The Router only consults this to break ties between
    /// candidates that are otherwise equally eligible — never to override
    /// a health or force_mode decision (§4.2, §4.4).
    pub fn model_score(&self, profile: TaskProfile, model_id: &str) -> i64 {
        match self.model_feedback.get(&(profile, model_id.to_string())) {
            Some(entry) => decay(
                entry.score.load(Ordering::Relaxed),
                entry.last_update.lock().expect("mood mutex poisoned").elapsed(),
                self.half_life,
            ),
            None => 0,
        }
    }
}

fn decay(score: i64, elapsed: Duration, half_life: Duration) -> i64 {
    if score == 0 || half_life.is_zero() {
        return score;
    }
    let halvings = elapsed.as_secs_f64() / half_life.as_secs_f64();
    let factor = 0.5_f64.powf(halvings);
    (score as f64 * factor).round() as i64
}

fn tone_for(score: i64) -> MoodTone {
    if score >= WARM_THRESHOLD {
        MoodTone::Warm
    } else if score <= CURT_THRESHOLD {
        MoodTone::Curt
    } else {
        MoodTone::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_chat_is_neutral() {
        let engine = MoodEngine::new(Duration::from_secs(3600));
        assert_eq!(engine.chat_mood(&ChatId::from("c1")), MoodTone::Neutral);
    }

    #[test]
    fn positive_reactions_warm_the_mood() {
        let engine = MoodEngine::new(Duration::from_secs(3600));
        let chat = ChatId::from("c1");
        for _ in 0..3 {
            engine.record_chat_reaction(&chat, Reaction::Positive);
        }
        assert_eq!(engine.chat_mood(&chat), MoodTone::Warm);
    }

    #[test]
    fn negative_reactions_turn_curt() {
        let engine = MoodEngine::new(Duration::from_secs(3600));
        let chat = ChatId::from("c1");
        engine.record_chat_reaction(&chat, Reaction::Negative);
        assert_eq!(engine.chat_mood(&chat), MoodTone::Curt);
    }

    #[test]
    fn score_decays_toward_zero_with_no_half_life_is_noop() {
        let engine = MoodEngine::new(Duration::ZERO);
        let chat = ChatId::from("c1");
        engine.record_chat_reaction(&chat, Reaction::Positive);
        // half_life of zero disables decay rather than dividing by zero.
        assert_eq!(engine.chat_mood(&chat), MoodTone::Neutral);
    }

    #[test]
    fn model_feedback_is_scoped_by_task_profile() {
        let engine = MoodEngine::new(Duration::from_secs(3600));
        engine.record_model_feedback(TaskProfile::General, "m1", Reaction::Positive);
        assert!(engine.model_score(TaskProfile::General, "m1") > 0);
        assert_eq!(engine.model_score(TaskProfile::Security, "m1"), 0);
    }

    #[test]
    fn auto_react_fires_at_most_once_per_n_messages() {
        let engine = MoodEngine::new(Duration::from_secs(3600));
        let chat = ChatId::from("c1");
        let fires: Vec<bool> = (0..6).map(|_| engine.should_auto_react(&chat, true, 3)).collect();
        assert_eq!(fires, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn auto_react_kill_switch_always_refuses() {
        let engine = MoodEngine::new(Duration::from_secs(3600));
        let chat = ChatId::from("c1");
        for _ in 0..10 {
            assert!(!engine.should_auto_react(&chat, false, 1));
        }
    }

    #[test]
    fn auto_react_every_n_zero_is_treated_as_disabled() {
        let engine = MoodEngine::new(Duration::from_secs(3600));
        let chat = ChatId::from("c1");
        assert!(!engine.should_auto_react(&chat, true, 0));
    }
}
