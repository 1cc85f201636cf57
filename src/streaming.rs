//! Streaming Client & Guardrails — §4.3.
//!
//! Consumes a backend's raw SSE byte stream (`backends::SseStream`) and turns
//! it into a sequence of `(TokenKind, String)` chunks, applying capped
//! buffering and loop detection along the way. This is additive on top of
//! the teacher's SSE-passthrough adapters (`backends::openai`, `.anthropic`,
//! `.ollama`) — those still own wire parsing; this module owns what happens
//! to the tokens once they're out.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::domain::Outcome;
use crate::error::ErrorCode;

/// Which logical channel a token chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Reasoning,
    Content,
}

/// A capped ring buffer of recent token text, used both to bound memory for
/// very long streams and as the input window for tail-loop detection.
struct CappedBuffer {
    chunks: VecDeque<String>,
    total_chars: usize,
    cap_chars: usize,
}

impl CappedBuffer {
    fn new(cap_chars: usize) -> Self {
        Self { chunks: VecDeque::new(), total_chars: 0, cap_chars }
    }

    fn push(&mut self, chunk: &str) {
        self.chunks.push_back(chunk.to_string());
        self.total_chars += chunk.chars().count();
        while self.total_chars > self.cap_chars {
            if let Some(front) = self.chunks.pop_front() {
                self.total_chars = self.total_chars.saturating_sub(front.chars().count());
            } else {
                break;
            }
        }
    }

    fn text(&self) -> String {
        self.chunks.iter().cloned().collect()
    }

    fn is_full(&self) -> bool {
        self.total_chars >= self.cap_chars
    }
}

/// Rolling-hash tail-loop detector: hashes fixed-size windows of recently
/// seen text and flags a loop once the same window hash repeats
/// `repeat_threshold` times in a row with no other window hash interleaved.
struct TailLoopDetector {
    window_chars: usize,
    repeat_threshold: u32,
    tail: String,
    last_hash: Option<u64>,
    repeat_count: u32,
}

impl TailLoopDetector {
    fn new(window_chars: usize, repeat_threshold: u32) -> Self {
        Self { window_chars, repeat_threshold, tail: String::new(), last_hash: None, repeat_count: 0 }
    }

    fn feed(&mut self, chunk: &str) -> bool {
        self.tail.push_str(chunk);
        if self.tail.chars().count() > self.window_chars * 2 {
            let excess = self.tail.chars().count() - self.window_chars * 2;
            self.tail = self.tail.chars().skip(excess).collect();
        }

        let chars: Vec<char> = self.tail.chars().collect();
        if chars.len() < self.window_chars {
            return false;
        }
        let window: String = chars[chars.len() - self.window_chars..].iter().collect();
        let hash = fnv1a(window.as_bytes());

        if Some(hash) == self.last_hash {
            self.repeat_count += 1;
        } else {
            self.last_hash = Some(hash);
            self.repeat_count = 1;
        }

        self.repeat_count >= self.repeat_threshold
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Guardrail violations recognized by the Streaming Client, each mapping to
/// a canonical `ErrorCode`/`Outcome` pair the Router consumes (§4.2, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guardrail {
    ReasoningCap,
    ReasoningLoop,
    ContentLoop,
    StreamTimeout,
    ConnectionError,
}

impl Guardrail {
    pub fn outcome(self) -> Outcome {
        match self {
            Guardrail::ReasoningCap => Outcome::Loop,
            Guardrail::ReasoningLoop | Guardrail::ContentLoop => Outcome::Loop,
            Guardrail::StreamTimeout => Outcome::Timeout,
            Guardrail::ConnectionError => Outcome::Transient,
        }
    }

    pub fn error_code(self) -> ErrorCode {
        match self {
            Guardrail::ReasoningCap => ErrorCode::ReasoningCapped,
            Guardrail::ReasoningLoop | Guardrail::ContentLoop => ErrorCode::LoopDetected,
            Guardrail::StreamTimeout => ErrorCode::Timeout,
            Guardrail::ConnectionError => ErrorCode::BackendUnreachable,
        }
    }
}

const LOOP_WINDOW_CHARS: usize = 24;
const LOOP_REPEAT_THRESHOLD: u32 = 6;

/// Accumulates a streamed reply, applying guardrails as chunks arrive.
pub struct StreamConsumer {
    reasoning_buf: CappedBuffer,
    content_buf: CappedBuffer,
    reasoning_loop: TailLoopDetector,
    content_loop: TailLoopDetector,
    reasoning_cap_tokens: u32,
    reasoning_tokens_seen: u32,
    sentinel_markers: Vec<String>,
}

impl StreamConsumer {
    pub fn new(reasoning_cap_tokens: u32, content_cap_chars: usize, reasoning_cap_chars: usize, sentinel_markers: Vec<String>) -> Self {
        Self {
            reasoning_buf: CappedBuffer::new(reasoning_cap_chars),
            content_buf: CappedBuffer::new(content_cap_chars),
            reasoning_loop: TailLoopDetector::new(LOOP_WINDOW_CHARS, LOOP_REPEAT_THRESHOLD),
            content_loop: TailLoopDetector::new(LOOP_WINDOW_CHARS, LOOP_REPEAT_THRESHOLD),
            reasoning_cap_tokens,
            reasoning_tokens_seen: 0,
            sentinel_markers,
        }
    }

    /// Feed one token chunk; returns `Some(guardrail)` the moment one trips.
    /// Once a guardrail trips, the caller must stop feeding further chunks.
    ///
    /// A sentinel marker found in `chunk` is scrubbed before the chunk is
    /// buffered — unlike every other guardrail, a sentinel leak is a
    /// sanitization concern, not an abort: the underlying backend may well
    /// be healthy, it just leaked a system-prompt marker into its output,
    /// and the reply continues once the marker is gone (§4.3).
    pub fn feed(&mut self, kind: TokenKind, chunk: &str) -> Option<Guardrail> {
        let scrubbed = self.scrub_sentinels(chunk);
        let chunk = scrubbed.as_str();
        if chunk.is_empty() {
            return None;
        }

        match kind {
            TokenKind::Reasoning => {
                self.reasoning_tokens_seen = self.reasoning_tokens_seen.saturating_add(estimate_tokens(chunk));
                self.reasoning_buf.push(chunk);
                if self.reasoning_tokens_seen >= self.reasoning_cap_tokens || self.reasoning_buf.is_full() {
                    return Some(Guardrail::ReasoningCap);
                }
                if self.reasoning_loop.feed(chunk) {
                    return Some(Guardrail::ReasoningLoop);
                }
            }
            TokenKind::Content => {
                self.content_buf.push(chunk);
                if self.content_loop.feed(chunk) {
                    return Some(Guardrail::ContentLoop);
                }
            }
        }
        None
    }

    /// Strip every configured sentinel marker out of `chunk`. A marker that
    /// straddles two chunks (split across an SSE frame boundary) is not
    /// caught here — only markers fully contained in one chunk are scrubbed.
    fn scrub_sentinels(&self, chunk: &str) -> String {
        if self.sentinel_markers.is_empty() {
            return chunk.to_string();
        }
        let mut out = chunk.to_string();
        for marker in &self.sentinel_markers {
            if !marker.is_empty() && out.contains(marker.as_str()) {
                out = out.replace(marker.as_str(), "");
            }
        }
        out
    }

    /// The reply text produced so far — always returned even on a guardrail
    /// trip, so a partial reply can still be sent (§4.3 "reply-completion
    /// guarantee": the chat always gets *something*, even if truncated).
    pub fn content_so_far(&self) -> String {
        self.content_buf.text()
    }

    pub fn reasoning_so_far(&self) -> String {
        self.reasoning_buf.text()
    }
}

fn estimate_tokens(text: &str) -> u32 {
    // Cheap fallback estimate (~4 chars/token); `tiktoken-rs` is used for the
    // Plan-level `cost_estimate_usd` cost math, not for the hot per-chunk path.
    ((text.chars().count() as f64) / 4.0).ceil() as u32
}

/// Drive a raw SSE byte stream through a backend-specific chunk parser and a
/// `StreamConsumer`, stopping at the first guardrail trip or stream end.
pub async fn consume(
    mut stream: std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>,
    mut parse_chunk: impl FnMut(&[u8]) -> Vec<(TokenKind, String)>,
    consumer: &mut StreamConsumer,
) -> Result<(), Guardrail> {
    while let Some(item) = stream.next().await {
        let bytes = match item {
            Ok(b) => b,
            Err(_) => return Err(Guardrail::ConnectionError),
        };
        for (kind, text) in parse_chunk(&bytes) {
            if let Some(g) = consumer.feed(kind, &text) {
                return Err(g);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_cap_trips_after_enough_tokens() {
        let mut consumer = StreamConsumer::new(4, 10_000, 10_000, vec![]);
        // "aaaa aaaa aaaa aaaa " ~ estimate_tokens scales with chars/4
        let trip = (0..10).find_map(|_| consumer.feed(TokenKind::Reasoning, "aaaaaaaa "));
        assert_eq!(trip, Some(Guardrail::ReasoningCap));
    }

    #[test]
    fn content_tail_loop_is_detected() {
        let mut consumer = StreamConsumer::new(100_000, 10_000, 10_000, vec![]);
        let mut trip = None;
        for _ in 0..20 {
            if let Some(g) = consumer.feed(TokenKind::Content, "loop loop loop ") {
                trip = Some(g);
                break;
            }
        }
        assert_eq!(trip, Some(Guardrail::ContentLoop));
    }

    #[test]
    fn varied_content_does_not_trip_loop_guardrail() {
        let mut consumer = StreamConsumer::new(100_000, 10_000, 10_000, vec![]);
        let words = ["the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog"];
        for (i, w) in words.iter().cycle().take(40).enumerate() {
            let chunk = format!("{w}{i} ");
            assert_eq!(consumer.feed(TokenKind::Content, &chunk), None);
        }
    }

    #[test]
    fn sentinel_marker_is_scrubbed_not_aborted() {
        let mut consumer = StreamConsumer::new(100_000, 10_000, 10_000, vec!["<<SYS_PROMPT>>".to_string()]);
        let trip = consumer.feed(TokenKind::Content, "leaked <<SYS_PROMPT>> data");
        assert_eq!(trip, None);
        assert_eq!(consumer.content_so_far(), "leaked  data");
    }

    #[test]
    fn chunk_made_empty_by_scrubbing_is_not_buffered() {
        let mut consumer = StreamConsumer::new(100_000, 10_000, 10_000, vec!["<<SYS_PROMPT>>".to_string()]);
        assert_eq!(consumer.feed(TokenKind::Content, "<<SYS_PROMPT>>"), None);
        assert_eq!(consumer.content_so_far(), "");
    }

    #[test]
    fn content_so_far_survives_a_guardrail_trip() {
        let mut consumer = StreamConsumer::new(100_000, 10_000, 10_000, vec![]);
        consumer.feed(TokenKind::Content, "hello world");
        assert_eq!(consumer.content_so_far(), "hello world");
    }

    #[test]
    fn guardrail_outcome_mapping() {
        assert_eq!(Guardrail::StreamTimeout.outcome(), Outcome::Timeout);
        assert_eq!(Guardrail::ConnectionError.outcome(), Outcome::Transient);
        assert_eq!(Guardrail::ReasoningLoop.outcome(), Outcome::Loop);
    }
}
