//! Local-testing chat endpoints — POST /chat and POST /chat/stream.
//!
//! No external tooling required: works with plain `curl`. Not the primary
//! frontend (that's the Telegram adapter's long-polling loop) — this
//! surface exists so the pipeline can be exercised without a chat platform.
//!
//! Request:  `{"user_id": "...", "message": "hello"}`
//! Response: `{"reply": "..."}` / SSE `data: {"text": "...", "is_final": bool}` events.

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::app::AppState;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ChatReply {
    pub reply: String,
}

#[derive(Serialize)]
pub struct ChatError {
    pub error: String,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// POST /chat — collects the full streamed turn and returns the final text.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatReply>, (StatusCode, Json<ChatError>)> {
    if req.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ChatError { error: "message cannot be empty".to_string() }),
        ));
    }

    match state.orchestrator.chat(&req.user_id, &req.message, now_ms()).await {
        Ok(reply) => Ok(Json(ChatReply { reply })),
        Err(e) => {
            warn!(error = %e, "POST /chat failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ChatError { error: e.to_string() }),
            ))
        }
    }
}

#[derive(Serialize)]
struct StreamEvent {
    text: String,
    is_final: bool,
}

/// POST /chat/stream — forwards each `StreamUpdate` as an SSE event.
///
/// `AppState` is already behind an `Arc`, so the background task that drives
/// the orchestrator holds its own clone rather than a raw pointer into the
/// handler's borrow.
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, mut rx) = mpsc::channel(64);
    let task_state = Arc::clone(&state);
    let user_id = req.user_id.clone();
    let message = req.message.clone();

    tokio::spawn(async move {
        if let Err(e) = task_state.orchestrator.stream_chat(&user_id, &message, now_ms(), tx).await {
            warn!(error = %e, "POST /chat/stream failed");
        }
    });

    let stream = async_stream::stream! {
        while let Some(update) = rx.recv().await {
            let event = StreamEvent { text: update.text, is_final: update.is_final };
            let json = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().data(json));
            if event.is_final {
                yield Ok(Event::default().data("[DONE]"));
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
