use async_trait::async_trait;

use crate::types::{Character, Message, MessageLogRecord, ModelTier, Snapshot};

/// Durable session storage boundary. Consumed by `SessionService` only;
/// `turnstile-store` provides the SQLite-backed implementation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_messages(&self, session_id: &str) -> anyhow::Result<Vec<Message>>;
    async fn set_messages(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()>;
    async fn append_message(
        &self,
        session_id: &str,
        message: &Message,
        max_history_items: u32,
        retention_count: u32,
    ) -> anyhow::Result<()>;

    async fn get_current_session_id(&self, user_id: &str) -> anyhow::Result<Option<String>>;
    async fn set_current_session_id(&self, user_id: &str, session_id: &str) -> anyhow::Result<()>;
    async fn get_last_session_id(&self, user_id: &str) -> anyhow::Result<Option<String>>;
    async fn set_last_session_id(&self, user_id: &str, session_id: &str) -> anyhow::Result<()>;

    async fn get_session_data(&self, session_id: &str) -> anyhow::Result<Option<serde_json::Value>>;
    async fn set_session_data(&self, session_id: &str, data: serde_json::Value) -> anyhow::Result<()>;

    async fn get_user_model_mode(&self, user_id: &str) -> anyhow::Result<ModelTier>;
    async fn set_user_model_mode(&self, user_id: &str, tier: ModelTier) -> anyhow::Result<()>;

    async fn get_last_active_time(&self, user_id: &str) -> anyhow::Result<Option<i64>>;
    async fn set_last_active_time(&self, user_id: &str, now_ms: i64) -> anyhow::Result<()>;
}

/// Append-only message log boundary.
#[async_trait]
pub trait MessageLogRepo: Send + Sync {
    async fn save(&self, record: MessageLogRecord) -> anyhow::Result<()>;
}

/// Named history snapshot boundary.
#[async_trait]
pub trait SnapshotRepo: Send + Sync {
    async fn create(&self, snapshot: Snapshot) -> anyhow::Result<()>;
    async fn get(&self, snapshot_id: &str) -> anyhow::Result<Option<Snapshot>>;
    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Snapshot>>;
}

/// Role-card system-of-record boundary. A miss is not an error — callers
/// fall through to a bundled file and finally a hardcoded default.
#[async_trait]
pub trait CharacterRepo: Send + Sync {
    async fn get_character(&self, role_id: &str) -> anyhow::Result<Option<Character>>;
}
