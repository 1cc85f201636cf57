//! Event ingestion endpoint — §2, §6.
//!
//! The bridge between a transport-agnostic `ChatTransport` implementation
//! (owned by the embedding application) and the Context Builder / Chat Work
//! Queue. The embedding app POSTs each inbound chat `Event` here; this
//! handler never talks to the chat platform itself — that's the transport's
//! job on the way out via `ChatTransport::send_reply`/`send_message`.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::domain::Event;
use crate::error::AppError;
use crate::ingest;
use crate::state::AppState;

/// `POST /api/events` — accept one inbound `Event` and either dispatch it as
/// an owner command or submit it to the Chat Work Queue. Returns immediately
/// once the event has been accepted, not once any resulting `Request`
/// completes — the reply, if any, arrives later via the transport.
pub async fn ingest(State(state): State<Arc<AppState>>, Json(event): Json<Event>) -> Result<Json<Value>, AppError> {
    ingest::handle_event(state.transport.as_ref(), &state, event).await?;
    Ok(Json(json!({ "accepted": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;
    use crate::state::test_app_state;

    #[tokio::test]
    async fn ingest_accepts_a_well_formed_event() {
        let state = test_app_state("CHATLOOM_TEST_EVENTS_INGEST");
        let event = Event::new("c1", "m1", "u1", EventKind::Text, "hello");
        let Json(result) = ingest(State(state), Json(event)).await.unwrap();
        assert_eq!(result["accepted"], true);
    }
}
