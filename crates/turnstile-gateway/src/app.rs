use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use turnstile_orchestrator::ChatOrchestrator;

/// Central shared state, passed as `Arc<AppState>` to every Axum handler.
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<ChatOrchestrator>) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }
}

/// Assemble the debug/local-testing HTTP surface: a health probe plus a
/// non-streaming and an SSE-streaming chat endpoint. The Telegram adapter
/// is the primary frontend; this surface exists for scripting and local
/// development without a chat platform.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/chat", post(crate::http::chat::chat_handler))
        .route("/chat/stream", post(crate::http::chat::chat_stream_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
