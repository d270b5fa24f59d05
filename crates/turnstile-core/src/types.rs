use serde::{Deserialize, Serialize};
use std::fmt;

/// One turn of conversation. Insertion order in a [`Session::history`] is
/// significant; duplicates are permitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Opaque session identifier, shaped `sess_<userId>_<creationMs>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Mint a new session id for `user_id` created at `now_ms`.
    pub fn mint(user_id: &str, now_ms: i64) -> Self {
        Self(format!("sess_{user_id}_{now_ms}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user-selectable label mapped to one channel by runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Basic,
    StandardA,
    StandardB,
}

impl Default for ModelTier {
    /// Matches spec.md §4.2: `getUserModelMode` defaults to `standardB` when absent.
    fn default() -> Self {
        ModelTier::StandardB
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTier::Basic => write!(f, "basic"),
            ModelTier::StandardA => write!(f, "standard_a"),
            ModelTier::StandardB => write!(f, "standard_b"),
        }
    }
}

impl std::str::FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(ModelTier::Basic),
            "standard_a" | "standardA" => Ok(ModelTier::StandardA),
            "standard_b" | "standardB" => Ok(ModelTier::StandardB),
            other => Err(format!("unknown model tier: {other}")),
        }
    }
}

/// A persisted conversation session. Owned exclusively by `SessionService`;
/// `history` may only be mutated through its methods (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: String,
    pub role_id: Option<String>,
    pub turn_count: u32,
    pub last_active_ms: i64,
    pub history: Vec<Message>,
}

/// Per-user pointer state kept in the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPointer {
    pub current_session_id: Option<SessionId>,
    pub last_session_id: Option<SessionId>,
    pub last_active_ms: Option<i64>,
    pub model_tier: ModelTier,
}

impl Default for UserPointer {
    fn default() -> Self {
        Self {
            current_session_id: None,
            last_session_id: None,
            last_active_ms: None,
            model_tier: ModelTier::default(),
        }
    }
}

/// Optional role-card extensions, carried through unmodified.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterExtensions {
    pub post_link: Option<String>,
    pub avatar: Option<String>,
    pub title: Option<String>,
}

/// Read-only snapshot of a role card. Never written by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub role_id: String,
    pub name: String,
    pub system_prompt: String,
    pub first_mes: String,
    #[serde(default)]
    pub extensions: CharacterExtensions,
}

/// A named, immutable copy of a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub user_id: String,
    pub role_id: Option<String>,
    pub snapshot_name: String,
    pub history: Vec<Message>,
    pub created_at: String,
}

/// Distinguishes a log record written on a fresh reply from one written
/// after a `/regenerate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnType {
    Normal,
    Regenerate,
}

impl fmt::Display for TurnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnType::Normal => write!(f, "normal"),
            TurnType::Regenerate => write!(f, "regenerate"),
        }
    }
}

/// One append-only record per completed assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogRecord {
    pub user_id: String,
    pub role_id: Option<String>,
    pub user_input: String,
    pub bot_reply: String,
    pub instructions: String,
    pub history_at_request: Vec<Message>,
    pub model_name: String,
    pub attempt_count: u32,
    pub turn_type: TurnType,
}

/// One `(endpoint, credential, model, timeouts)` tuple inside a [`Pipeline`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub provider: String,
    pub url: String,
    pub key: String,
    pub model: String,
    pub firstchunk_timeout_ms: u64,
    pub total_timeout_ms: u64,
}

/// An ordered list of profiles attempted in turn with failover semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub channel_id: String,
    pub profiles: Vec<Profile>,
}

/// `ai_config_source` configuration document: channels plus the tier→channel map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfigSource {
    pub channels: std::collections::HashMap<String, Vec<Profile>>,
    pub tier_mapping: std::collections::HashMap<ModelTier, String>,
}
