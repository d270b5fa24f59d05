use std::sync::Mutex;

use rusqlite::{params, OptionalExtension};
use tracing::instrument;
use turnstile_core::{
    Character, CharacterExtensions, Message, MessageLogRecord, ModelTier, Role, SessionId, Snapshot, TurnType, UserPointer,
};

use crate::error::{Result, StoreError};

/// Thread-safe SQLite-backed system of record. Wraps a single connection
/// in a `Mutex`; sufficient for the single-node deployment target.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: rusqlite::Connection) -> Self {
        Self { db: Mutex::new(conn) }
    }

    /// Replace a session's entire history, renumbering ordinals from zero.
    /// Used by rollback/reset/character-switch operations.
    #[instrument(skip(self, messages), fields(session_id = %session_id, count = messages.len()))]
    pub fn replace_history(&self, session_id: &SessionId, messages: &[Message]) -> Result<()> {
        let mut db = self.db.lock().expect("store connection poisoned");
        let tx = db.transaction()?;
        tx.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id.as_str()])?;
        for (ordinal, message) in messages.iter().enumerate() {
            tx.execute(
                "INSERT INTO messages (session_id, ordinal, role, content) VALUES (?1, ?2, ?3, ?4)",
                params![session_id.as_str(), ordinal as i64, message.role.to_string(), message.content],
            )?;
        }
        tx.execute(
            "UPDATE sessions SET turn_count = ?1 WHERE session_id = ?2",
            params![messages.len() as i64, session_id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_history_locked(&self, db: &rusqlite::Connection, session_id: &str) -> Result<Vec<Message>> {
        let mut stmt = db.prepare(
            "SELECT role, content FROM messages WHERE session_id = ?1 ORDER BY ordinal ASC",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn trim_history_locked(&self, db: &rusqlite::Connection, session_id: &SessionId, retention_count: u32) -> Result<()> {
        db.execute(
            "DELETE FROM messages WHERE session_id = ?1 AND ordinal <= (
                SELECT MAX(ordinal) - ?2 FROM messages WHERE session_id = ?1
            )",
            params![session_id.as_str(), retention_count as i64],
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id))]
    pub fn get_user_pointer(&self, user_id: &str) -> Result<Option<UserPointer>> {
        let db = self.db.lock().expect("store connection poisoned");
        db.query_row(
            "SELECT current_session_id, last_session_id, last_active_ms, model_tier
             FROM user_pointers WHERE user_id = ?1",
            params![user_id],
            row_to_user_pointer,
        )
        .optional()
        .map_err(StoreError::from)
    }

    #[instrument(skip(self, pointer), fields(user_id))]
    pub fn upsert_user_pointer(&self, user_id: &str, pointer: &UserPointer) -> Result<()> {
        let db = self.db.lock().expect("store connection poisoned");
        db.execute(
            "INSERT INTO user_pointers (user_id, current_session_id, last_session_id, last_active_ms, model_tier)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                current_session_id = excluded.current_session_id,
                last_session_id = excluded.last_session_id,
                last_active_ms = excluded.last_active_ms,
                model_tier = excluded.model_tier",
            params![
                user_id,
                pointer.current_session_id.as_ref().map(|s| s.as_str()),
                pointer.last_session_id.as_ref().map(|s| s.as_str()),
                pointer.last_active_ms,
                pointer.model_tier.to_string(),
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(user_id = %record.user_id))]
    pub fn append_message_log(&self, record: &MessageLogRecord) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let history_json = serde_json::to_string(&record.history_at_request)?;
        let db = self.db.lock().expect("store connection poisoned");
        db.execute(
            "INSERT INTO message_log
             (user_id, role_id, user_input, bot_reply, instructions, history_at_request,
              model_name, attempt_count, turn_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.user_id,
                record.role_id,
                record.user_input,
                record.bot_reply,
                record.instructions,
                history_json,
                record.model_name,
                record.attempt_count,
                record.turn_type.to_string(),
                now,
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self, snapshot), fields(snapshot_id = %snapshot.snapshot_id))]
    pub fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let history_json = serde_json::to_string(&snapshot.history)?;
        let db = self.db.lock().expect("store connection poisoned");
        db.execute(
            "INSERT INTO chat_snapshots (snapshot_id, user_id, role_id, snapshot_name, history, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(snapshot_id) DO UPDATE SET history = excluded.history, created_at = excluded.created_at",
            params![
                snapshot.snapshot_id,
                snapshot.user_id,
                snapshot.role_id,
                snapshot.snapshot_name,
                history_json,
                snapshot.created_at,
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(snapshot_id))]
    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<Snapshot>> {
        let db = self.db.lock().expect("store connection poisoned");
        db.query_row(
            "SELECT snapshot_id, user_id, role_id, snapshot_name, history, created_at
             FROM chat_snapshots WHERE snapshot_id = ?1",
            params![snapshot_id],
            row_to_snapshot,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Read a `runtime_config` row, returning the tagged JSON `value`.
    #[instrument(skip(self), fields(key))]
    pub fn get_config_row(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let db = self.db.lock().expect("store connection poisoned");
        let raw: Option<String> = db
            .query_row("SELECT value FROM runtime_config WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

}

#[async_trait::async_trait]
impl turnstile_core::ConfigStore for SqliteStore {
    async fn get_config(&self, key: &str) -> std::result::Result<Option<serde_json::Value>, String> {
        self.get_config_row(key).map_err(|e| e.to_string())
    }
}

impl SqliteStore {
    fn ensure_session_row(&self, db: &rusqlite::Connection, session_id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT OR IGNORE INTO sessions (session_id, user_id, turn_count, last_active_ms, created_at)
             VALUES (?1, '', 0, 0, ?2)",
            params![session_id, now],
        )?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl turnstile_core::SessionStore for SqliteStore {
    async fn get_messages(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        let db = self.db.lock().expect("store connection poisoned");
        Ok(self.get_history_locked(&db, session_id)?)
    }

    async fn set_messages(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        let db = self.db.lock().expect("store connection poisoned");
        self.ensure_session_row(&db, session_id)?;
        drop(db);
        self.replace_history(&SessionId(session_id.to_string()), messages)?;
        Ok(())
    }

    async fn append_message(
        &self,
        session_id: &str,
        message: &Message,
        max_history_items: u32,
        retention_count: u32,
    ) -> anyhow::Result<()> {
        let db = self.db.lock().expect("store connection poisoned");
        self.ensure_session_row(&db, session_id)?;
        let next_ordinal: i64 = db
            .query_row(
                "SELECT COALESCE(MAX(ordinal), -1) + 1 FROM messages WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .unwrap_or(0);
        db.execute(
            "INSERT INTO messages (session_id, ordinal, role, content) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, next_ordinal, message.role.to_string(), message.content],
        )?;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        if count as u32 > max_history_items {
            self.trim_history_locked(&db, &SessionId(session_id.to_string()), retention_count)?;
        }
        Ok(())
    }

    async fn get_current_session_id(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .get_user_pointer(user_id)?
            .and_then(|p| p.current_session_id)
            .map(|s| s.0))
    }

    async fn set_current_session_id(&self, user_id: &str, session_id: &str) -> anyhow::Result<()> {
        let mut pointer = self.get_user_pointer(user_id)?.unwrap_or_default();
        pointer.current_session_id = Some(SessionId(session_id.to_string()));
        self.upsert_user_pointer(user_id, &pointer)?;
        Ok(())
    }

    async fn get_last_session_id(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .get_user_pointer(user_id)?
            .and_then(|p| p.last_session_id)
            .map(|s| s.0))
    }

    async fn set_last_session_id(&self, user_id: &str, session_id: &str) -> anyhow::Result<()> {
        let mut pointer = self.get_user_pointer(user_id)?.unwrap_or_default();
        pointer.last_session_id = Some(SessionId(session_id.to_string()));
        self.upsert_user_pointer(user_id, &pointer)?;
        Ok(())
    }

    async fn get_session_data(&self, session_id: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let db = self.db.lock().expect("store connection poisoned");
        let raw: Option<String> = db
            .query_row("SELECT data FROM sessions WHERE session_id = ?1", params![session_id], |row| row.get(0))
            .optional()?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    async fn set_session_data(&self, session_id: &str, data: serde_json::Value) -> anyhow::Result<()> {
        let db = self.db.lock().expect("store connection poisoned");
        self.ensure_session_row(&db, session_id)?;
        db.execute(
            "UPDATE sessions SET data = ?1 WHERE session_id = ?2",
            params![serde_json::to_string(&data)?, session_id],
        )?;
        Ok(())
    }

    async fn get_user_model_mode(&self, user_id: &str) -> anyhow::Result<ModelTier> {
        Ok(self
            .get_user_pointer(user_id)?
            .map(|p| p.model_tier)
            .unwrap_or_default())
    }

    async fn set_user_model_mode(&self, user_id: &str, tier: ModelTier) -> anyhow::Result<()> {
        let mut pointer = self.get_user_pointer(user_id)?.unwrap_or_default();
        pointer.model_tier = tier;
        self.upsert_user_pointer(user_id, &pointer)?;
        Ok(())
    }

    async fn get_last_active_time(&self, user_id: &str) -> anyhow::Result<Option<i64>> {
        Ok(self.get_user_pointer(user_id)?.and_then(|p| p.last_active_ms))
    }

    async fn set_last_active_time(&self, user_id: &str, now_ms: i64) -> anyhow::Result<()> {
        let mut pointer = self.get_user_pointer(user_id)?.unwrap_or_default();
        pointer.last_active_ms = Some(now_ms);
        self.upsert_user_pointer(user_id, &pointer)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl turnstile_core::MessageLogRepo for SqliteStore {
    async fn save(&self, record: MessageLogRecord) -> anyhow::Result<()> {
        self.append_message_log(&record)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl turnstile_core::SnapshotRepo for SqliteStore {
    async fn create(&self, snapshot: Snapshot) -> anyhow::Result<()> {
        self.create_snapshot(&snapshot)?;
        Ok(())
    }

    async fn get(&self, snapshot_id: &str) -> anyhow::Result<Option<Snapshot>> {
        Ok(self.get_snapshot(snapshot_id)?)
    }

    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Snapshot>> {
        let db = self.db.lock().expect("store connection poisoned");
        let mut stmt = db.prepare(
            "SELECT snapshot_id, user_id, role_id, snapshot_name, history, created_at
             FROM chat_snapshots WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_snapshot)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

#[async_trait::async_trait]
impl turnstile_core::CharacterRepo for SqliteStore {
    async fn get_character(&self, role_id: &str) -> anyhow::Result<Option<Character>> {
        let db = self.db.lock().expect("store connection poisoned");
        let row = db
            .query_row(
                "SELECT role_id, name, system_prompt, first_mes, extensions FROM characters WHERE role_id = ?1",
                params![role_id],
                row_to_character,
            )
            .optional()?;
        Ok(row)
    }
}

fn row_to_character(row: &rusqlite::Row<'_>) -> rusqlite::Result<Character> {
    let extensions_json: Option<String> = row.get(4)?;
    let extensions = extensions_json
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_else(CharacterExtensions::default);
    Ok(Character {
        role_id: row.get(0)?,
        name: row.get(1)?,
        system_prompt: row.get(2)?,
        first_mes: row.get(3)?,
        extensions,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(0)?;
    let role = match role_str.as_str() {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => Role::System,
    };
    Ok(Message { role, content: row.get(1)? })
}

fn row_to_user_pointer(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserPointer> {
    let current_session_id: Option<String> = row.get(0)?;
    let last_session_id: Option<String> = row.get(1)?;
    let tier_str: String = row.get(3)?;
    Ok(UserPointer {
        current_session_id: current_session_id.map(SessionId),
        last_session_id: last_session_id.map(SessionId),
        last_active_ms: row.get(2)?,
        model_tier: tier_str.parse().unwrap_or_default(),
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
    let history_json: String = row.get(4)?;
    let history: Vec<Message> = serde_json::from_str(&history_json).unwrap_or_default();
    Ok(Snapshot {
        snapshot_id: row.get(0)?,
        user_id: row.get(1)?,
        role_id: row.get(2)?,
        snapshot_name: row.get(3)?,
        history,
        created_at: row.get(5)?,
    })
}
