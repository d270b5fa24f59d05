use std::sync::Arc;

use tracing::{instrument, warn};
use turnstile_core::{
    Character, ConfigResolver, Message, MessageLogRepo, ModelTier, Role, Session, SessionId, SessionStore, Snapshot,
    SnapshotRepo,
};

use crate::character::CharacterLoader;
use crate::error::{Result, SessionError};

const DEFAULT_SESSION_TIMEOUT_MINUTES: f64 = 30.0;
const DEFAULT_MAX_HISTORY_ITEMS: f64 = 50.0;
const DEFAULT_HISTORY_RETENTION_COUNT: f64 = 40.0;

/// Outcome of [`SessionService::resolve_session_id`].
pub struct Resolution {
    pub session_id: SessionId,
    pub is_new: bool,
    pub expired_session_id: Option<SessionId>,
}

/// Per-session metadata carried in the store's generic `sessionData` blob.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct SessionMeta {
    role_id: Option<String>,
    post_link: Option<String>,
    avatar: Option<String>,
    turn_count: u32,
}

/// Owns session objects exclusively: history lists may only be mutated
/// through these methods.
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    message_log: Arc<dyn MessageLogRepo>,
    snapshots: Arc<dyn SnapshotRepo>,
    config: Arc<ConfigResolver>,
    characters: CharacterLoader,
    default_role_id: String,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        message_log: Arc<dyn MessageLogRepo>,
        snapshots: Arc<dyn SnapshotRepo>,
        config: Arc<ConfigResolver>,
        characters: CharacterLoader,
        default_role_id: String,
    ) -> Self {
        Self {
            store,
            message_log,
            snapshots,
            config,
            characters,
            default_role_id,
        }
    }

    #[instrument(skip(self), fields(user_id))]
    pub async fn resolve_session_id(&self, user_id: &str, now_ms: i64) -> Result<Resolution> {
        let current = self.store.get_current_session_id(user_id).await?;

        let Some(current) = current else {
            let minted = SessionId::mint(user_id, now_ms);
            self.store.set_current_session_id(user_id, minted.as_str()).await?;
            self.store.set_last_active_time(user_id, now_ms).await?;
            return Ok(Resolution {
                session_id: minted,
                is_new: true,
                expired_session_id: None,
            });
        };

        let last_active = self.store.get_last_active_time(user_id).await?;
        let Some(last_active) = last_active else {
            self.store.set_last_active_time(user_id, now_ms).await?;
            return Ok(Resolution {
                session_id: SessionId(current),
                is_new: false,
                expired_session_id: None,
            });
        };

        let timeout_minutes = self
            .config
            .get_number("session_timeout_minutes", DEFAULT_SESSION_TIMEOUT_MINUTES)
            .await;
        let timeout_ms = (timeout_minutes * 60_000.0) as i64;

        if now_ms - last_active > timeout_ms {
            let expired = SessionId(current);
            self.store.set_last_session_id(user_id, expired.as_str()).await?;
            let minted = SessionId::mint(user_id, now_ms);
            self.store.set_current_session_id(user_id, minted.as_str()).await?;
            self.store.set_last_active_time(user_id, now_ms).await?;
            return Ok(Resolution {
                session_id: minted,
                is_new: true,
                expired_session_id: Some(expired),
            });
        }

        self.store.set_last_active_time(user_id, now_ms).await?;
        Ok(Resolution {
            session_id: SessionId(current),
            is_new: false,
            expired_session_id: None,
        })
    }

    /// Resolve the active session, hydrate its history (empty if new),
    /// carry the role forward across an expiry, and load the character.
    #[instrument(skip(self), fields(user_id))]
    pub async fn get_or_create_session(&self, user_id: &str, now_ms: i64) -> Result<(Session, Character)> {
        let resolution = self.resolve_session_id(user_id, now_ms).await?;

        let meta_source = if resolution.is_new {
            resolution.expired_session_id.as_ref()
        } else {
            Some(&resolution.session_id)
        };
        let role_id = match meta_source {
            Some(sid) => self.read_meta(sid.as_str()).await.role_id,
            None => None,
        };
        let role_id = role_id.unwrap_or_else(|| self.default_role_id.clone());

        if resolution.is_new {
            let mut meta = SessionMeta::default();
            meta.role_id = Some(role_id.clone());
            self.write_meta(resolution.session_id.as_str(), &meta).await?;
        }

        let history = self.store.get_messages(resolution.session_id.as_str()).await?;
        let meta = self.read_meta(resolution.session_id.as_str()).await;
        let character = self.characters.load(&role_id).await;

        let session = Session {
            session_id: resolution.session_id,
            user_id: user_id.to_string(),
            role_id: Some(role_id),
            turn_count: meta.turn_count,
            last_active_ms: now_ms,
            history,
        };
        Ok((session, character))
    }

    /// Append `msgs` to the session's history, bumping `turnCount` when the
    /// batch contains both a user and an assistant message. Write failures
    /// are logged, not thrown — the reply has already been produced.
    #[instrument(skip(self, msgs), fields(session_id = %session.session_id, count = msgs.len()))]
    pub async fn append_messages(&self, session: &mut Session, msgs: Vec<Message>) {
        let max_history_items = self.config.get_number("max_history_items", DEFAULT_MAX_HISTORY_ITEMS).await as u32;
        let retention_count = self
            .config
            .get_number("history_retention_count", DEFAULT_HISTORY_RETENTION_COUNT)
            .await as u32;

        for msg in &msgs {
            if let Err(e) = self
                .store
                .append_message(session.session_id.as_str(), msg, max_history_items, retention_count)
                .await
            {
                warn!(session_id = %session.session_id, error = %e, "append_message failed");
            }
            session.history.push(msg.clone());
        }
        if session.history.len() as u32 > max_history_items {
            let overflow = session.history.len().saturating_sub(retention_count as usize);
            session.history.drain(0..overflow);
        }

        let has_user = msgs.iter().any(|m| m.role == Role::User);
        let has_assistant = msgs.iter().any(|m| m.role == Role::Assistant);
        if has_user && has_assistant {
            session.turn_count += 1;
            let mut meta = self.read_meta(session.session_id.as_str()).await;
            meta.turn_count = session.turn_count;
            if let Err(e) = self.write_meta(session.session_id.as_str(), &meta).await {
                warn!(session_id = %session.session_id, error = %e, "session metadata write failed");
            }
        }
    }

    /// Truncate history at (inclusive of) the last user message, returning
    /// its content for re-send. A no-op on empty or user-less histories.
    #[instrument(skip(self), fields(session_id = %session.session_id))]
    pub async fn rollback_history_to_last_user(&self, session: &mut Session) -> Result<Option<String>> {
        let Some(idx) = session.history.iter().rposition(|m| m.role == Role::User) else {
            return Ok(None);
        };
        let content = session.history[idx].content.clone();
        let truncated: Vec<Message> = session.history[..=idx].to_vec();
        self.store.set_messages(session.session_id.as_str(), &truncated).await?;
        session.history = truncated;
        Ok(Some(content))
    }

    /// Clear history, preserving role and turn count metadata.
    #[instrument(skip(self), fields(user_id))]
    pub async fn reset_session_history(&self, user_id: &str, now_ms: i64) -> Result<Session> {
        let (mut session, _character) = self.get_or_create_session(user_id, now_ms).await?;
        self.store.set_messages(session.session_id.as_str(), &[]).await?;
        session.history.clear();
        Ok(session)
    }

    /// Switch the active character: clears history and updates role
    /// metadata. Re-throws write failures to the caller.
    #[instrument(skip(self), fields(user_id, role_id))]
    pub async fn switch_character(&self, user_id: &str, role_id: &str, now_ms: i64) -> Result<Character> {
        let character = self.characters.load(role_id).await;
        let (session, _) = self.get_or_create_session(user_id, now_ms).await?;

        self.store.set_messages(session.session_id.as_str(), &[]).await?;

        let mut meta = self.read_meta(session.session_id.as_str()).await;
        meta.role_id = Some(role_id.to_string());
        meta.post_link = character.extensions.post_link.clone();
        meta.avatar = character.extensions.avatar.clone();
        self.write_meta(session.session_id.as_str(), &meta).await?;

        Ok(character)
    }

    /// Snapshot the current history under `<YYYYMMDD_HHMMSS>_<userLabel>_<characterTitle>`.
    /// A no-op (returns `None`) on empty history.
    #[instrument(skip(self), fields(user_id, user_label))]
    pub async fn create_snapshot(&self, user_id: &str, user_label: &str, now_ms: i64) -> Result<Option<Snapshot>> {
        let (session, character) = self.get_or_create_session(user_id, now_ms).await?;
        if session.history.is_empty() {
            return Ok(None);
        }

        let timestamp = chrono::DateTime::from_timestamp_millis(now_ms)
            .unwrap_or_else(chrono::Utc::now)
            .format("%Y%m%d_%H%M%S");
        let character_title = character.extensions.title.clone().unwrap_or(character.name);
        let snapshot_name = format!("{timestamp}_{user_label}_{character_title}");

        let snapshot = Snapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            role_id: session.role_id.clone(),
            snapshot_name,
            history: session.history.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.snapshots.create(snapshot.clone()).await?;
        Ok(Some(snapshot))
    }

    /// Restore a snapshot's history into the current experience window,
    /// resetting `turnCount` to `len/2`.
    #[instrument(skip(self), fields(user_id, snapshot_id))]
    pub async fn restore_snapshot(&self, user_id: &str, snapshot_id: &str, now_ms: i64) -> Result<Option<Session>> {
        let Some(snapshot) = self.snapshots.get(snapshot_id).await? else {
            return Ok(None);
        };
        let (mut session, _character) = self.get_or_create_session(user_id, now_ms).await?;

        self.store
            .set_messages(session.session_id.as_str(), &snapshot.history)
            .await?;
        session.history = snapshot.history.clone();
        session.turn_count = (session.history.len() / 2) as u32;

        let mut meta = self.read_meta(session.session_id.as_str()).await;
        meta.turn_count = session.turn_count;
        self.write_meta(session.session_id.as_str(), &meta).await?;

        Ok(Some(session))
    }

    pub async fn save_log(&self, record: turnstile_core::MessageLogRecord) {
        if let Err(e) = self.message_log.save(record).await {
            warn!(error = %e, "message log write failed");
        }
    }

    pub async fn get_user_model_tier(&self, user_id: &str) -> ModelTier {
        self.store.get_user_model_mode(user_id).await.unwrap_or_default()
    }

    async fn read_meta(&self, session_id: &str) -> SessionMeta {
        match self.store.get_session_data(session_id).await {
            Ok(Some(raw)) => serde_json::from_value(raw).unwrap_or_default(),
            _ => SessionMeta::default(),
        }
    }

    async fn write_meta(&self, session_id: &str, meta: &SessionMeta) -> Result<()> {
        let raw = serde_json::to_value(meta).unwrap_or(serde_json::Value::Null);
        self.store.set_session_data(session_id, raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use turnstile_core::{CharacterRepo, ConfigStore, DistributedCache};

    #[derive(Default)]
    struct InMemoryStore {
        messages: StdMutex<HashMap<String, Vec<Message>>>,
        current_session: StdMutex<HashMap<String, String>>,
        last_session: StdMutex<HashMap<String, String>>,
        session_data: StdMutex<HashMap<String, serde_json::Value>>,
        last_active: StdMutex<HashMap<String, i64>>,
    }

    #[async_trait]
    impl SessionStore for InMemoryStore {
        async fn get_messages(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
            Ok(self.messages.lock().unwrap().get(session_id).cloned().unwrap_or_default())
        }
        async fn set_messages(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
            self.messages.lock().unwrap().insert(session_id.to_string(), messages.to_vec());
            Ok(())
        }
        async fn append_message(&self, session_id: &str, message: &Message, _max: u32, _retention: u32) -> anyhow::Result<()> {
            self.messages
                .lock()
                .unwrap()
                .entry(session_id.to_string())
                .or_default()
                .push(message.clone());
            Ok(())
        }
        async fn get_current_session_id(&self, user_id: &str) -> anyhow::Result<Option<String>> {
            Ok(self.current_session.lock().unwrap().get(user_id).cloned())
        }
        async fn set_current_session_id(&self, user_id: &str, session_id: &str) -> anyhow::Result<()> {
            self.current_session.lock().unwrap().insert(user_id.to_string(), session_id.to_string());
            Ok(())
        }
        async fn get_last_session_id(&self, user_id: &str) -> anyhow::Result<Option<String>> {
            Ok(self.last_session.lock().unwrap().get(user_id).cloned())
        }
        async fn set_last_session_id(&self, user_id: &str, session_id: &str) -> anyhow::Result<()> {
            self.last_session.lock().unwrap().insert(user_id.to_string(), session_id.to_string());
            Ok(())
        }
        async fn get_session_data(&self, session_id: &str) -> anyhow::Result<Option<serde_json::Value>> {
            Ok(self.session_data.lock().unwrap().get(session_id).cloned())
        }
        async fn set_session_data(&self, session_id: &str, data: serde_json::Value) -> anyhow::Result<()> {
            self.session_data.lock().unwrap().insert(session_id.to_string(), data);
            Ok(())
        }
        async fn get_user_model_mode(&self, _user_id: &str) -> anyhow::Result<ModelTier> {
            Ok(ModelTier::default())
        }
        async fn set_user_model_mode(&self, _user_id: &str, _tier: ModelTier) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_last_active_time(&self, user_id: &str) -> anyhow::Result<Option<i64>> {
            Ok(self.last_active.lock().unwrap().get(user_id).copied())
        }
        async fn set_last_active_time(&self, user_id: &str, now_ms: i64) -> anyhow::Result<()> {
            self.last_active.lock().unwrap().insert(user_id.to_string(), now_ms);
            Ok(())
        }
    }

    #[async_trait]
    impl MessageLogRepo for InMemoryStore {
        async fn save(&self, _record: turnstile_core::MessageLogRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SnapshotRepo for InMemoryStore {
        async fn create(&self, _snapshot: Snapshot) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get(&self, _snapshot_id: &str) -> anyhow::Result<Option<Snapshot>> {
            Ok(None)
        }
        async fn list_for_user(&self, _user_id: &str) -> anyhow::Result<Vec<Snapshot>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl CharacterRepo for InMemoryStore {
        async fn get_character(&self, _role_id: &str) -> anyhow::Result<Option<Character>> {
            Ok(None)
        }
    }

    struct EmptyConfigStore;
    #[async_trait]
    impl ConfigStore for EmptyConfigStore {
        async fn get_config(&self, _key: &str) -> std::result::Result<Option<serde_json::Value>, String> {
            Ok(None)
        }
    }

    struct EmptyCache;
    #[async_trait]
    impl DistributedCache for EmptyCache {
        async fn get(&self, _key: &str) -> Option<serde_json::Value> {
            None
        }
        async fn set_with_ttl(&self, _key: &str, _value: serde_json::Value, _ttl_secs: i64) {}
    }

    fn build_service(store: Arc<InMemoryStore>) -> SessionService {
        let config = Arc::new(ConfigResolver::new(Arc::new(EmptyCache), Arc::new(EmptyConfigStore)));
        let characters = CharacterLoader::new(store.clone(), std::env::temp_dir(), "default".to_string());
        SessionService::new(store.clone(), store.clone(), store, config, characters, "default".to_string())
    }

    #[tokio::test]
    async fn resolve_session_id_mints_a_fresh_session_for_a_new_user() {
        let store = Arc::new(InMemoryStore::default());
        let service = build_service(store);

        let resolution = service.resolve_session_id("u1", 1_000).await.unwrap();
        assert!(resolution.is_new);
        assert!(resolution.expired_session_id.is_none());
        assert_eq!(resolution.session_id.as_str(), "sess_u1_1000");
    }

    #[tokio::test]
    async fn resolve_session_id_continues_within_the_timeout_window() {
        let store = Arc::new(InMemoryStore::default());
        let service = build_service(store);

        let first = service.resolve_session_id("u1", 1_000).await.unwrap();
        let second = service.resolve_session_id("u1", 2_000).await.unwrap();

        assert!(!second.is_new);
        assert_eq!(second.session_id, first.session_id);
    }

    #[tokio::test]
    async fn resolve_session_id_mints_a_new_session_past_the_expiry_boundary() {
        let store = Arc::new(InMemoryStore::default());
        let service = build_service(store);

        let first = service.resolve_session_id("u1", 1_000).await.unwrap();
        // Default timeout is 30 minutes; push well past it.
        let past_expiry = 1_000 + 31 * 60_000;
        let second = service.resolve_session_id("u1", past_expiry).await.unwrap();

        assert!(second.is_new);
        assert_eq!(second.expired_session_id, Some(first.session_id));
        assert_ne!(second.session_id.as_str(), "sess_u1_1000");
    }

    #[tokio::test]
    async fn resolve_session_id_treats_the_timeout_boundary_itself_as_not_expired() {
        let timeout_ms = (DEFAULT_SESSION_TIMEOUT_MINUTES * 60_000.0) as i64;

        let store = Arc::new(InMemoryStore::default());
        let service = build_service(store);
        let first = service.resolve_session_id("u1", 0).await.unwrap();
        let at_boundary = service.resolve_session_id("u1", timeout_ms).await.unwrap();
        assert!(!at_boundary.is_new);
        assert_eq!(at_boundary.session_id, first.session_id);
    }

    #[tokio::test]
    async fn resolve_session_id_expires_one_millisecond_past_the_boundary() {
        let timeout_ms = (DEFAULT_SESSION_TIMEOUT_MINUTES * 60_000.0) as i64;

        let store = Arc::new(InMemoryStore::default());
        let service = build_service(store);
        let first = service.resolve_session_id("u1", 0).await.unwrap();
        let past_boundary = service.resolve_session_id("u1", timeout_ms + 1).await.unwrap();
        assert!(past_boundary.is_new);
        assert_eq!(past_boundary.expired_session_id, Some(first.session_id));
    }

    #[tokio::test]
    async fn get_or_create_session_carries_role_forward_across_expiry() {
        let store = Arc::new(InMemoryStore::default());
        let service = build_service(store);

        service.switch_character("u1", "alt_role", 1_000).await.unwrap();
        let past_expiry = 1_000 + 31 * 60_000;
        let (session, _character) = service.get_or_create_session("u1", past_expiry).await.unwrap();

        assert_eq!(session.role_id.as_deref(), Some("alt_role"));
        assert!(session.history.is_empty());
    }

    #[tokio::test]
    async fn rollback_history_to_last_user_is_a_no_op_on_empty_history() {
        let store = Arc::new(InMemoryStore::default());
        let service = build_service(store);

        let (mut session, _character) = service.get_or_create_session("u1", 1_000).await.unwrap();
        let result = service.rollback_history_to_last_user(&mut session).await.unwrap();

        assert!(result.is_none());
        assert!(session.history.is_empty());
    }

    #[tokio::test]
    async fn rollback_history_to_last_user_truncates_at_the_last_user_message() {
        let store = Arc::new(InMemoryStore::default());
        let service = build_service(store);

        let (mut session, _character) = service.get_or_create_session("u1", 1_000).await.unwrap();
        service
            .append_messages(&mut session, vec![Message::user("hi"), Message::assistant("hello")])
            .await;

        let result = service.rollback_history_to_last_user(&mut session).await.unwrap();

        assert_eq!(result.as_deref(), Some("hi"));
        assert_eq!(session.history.len(), 1);
        assert_eq!(session.history[0].role, Role::User);
    }

    #[tokio::test]
    async fn append_messages_bumps_turn_count_only_on_a_complete_user_assistant_pair() {
        let store = Arc::new(InMemoryStore::default());
        let service = build_service(store);

        let (mut session, _character) = service.get_or_create_session("u1", 1_000).await.unwrap();
        service.append_messages(&mut session, vec![Message::user("hi")]).await;
        assert_eq!(session.turn_count, 0);

        service
            .append_messages(&mut session, vec![Message::user("hi"), Message::assistant("hello")])
            .await;
        assert_eq!(session.turn_count, 1);
    }

    #[tokio::test]
    async fn rollback_history_to_last_user_is_idempotent_when_tail_is_already_user() {
        let store = Arc::new(InMemoryStore::default());
        let service = build_service(store);

        let (mut session, _character) = service.get_or_create_session("u1", 1_000).await.unwrap();
        service.append_messages(&mut session, vec![Message::user("hi")]).await;

        let first = service.rollback_history_to_last_user(&mut session).await.unwrap();
        let second = service.rollback_history_to_last_user(&mut session).await.unwrap();

        assert_eq!(first.as_deref(), Some("hi"));
        assert_eq!(second.as_deref(), Some("hi"));
        assert_eq!(session.history.len(), 1);
    }
}
