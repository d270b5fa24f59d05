use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::types::AiConfigSource;

fn empty_ai_config_source() -> AiConfigSource {
    AiConfigSource {
        channels: HashMap::new(),
        tier_mapping: HashMap::new(),
    }
}

pub const MEMORY_TTL_SECS: i64 = 60;

/// Process bootstrap configuration (`turnstile.toml` + `TURNSTILE_*` env
/// overrides). Distinct from the runtime three-tier [`ConfigResolver`]
/// below: these are the values needed before any store connection exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub messaging_token: Option<String>,
    pub proxy: Option<String>,
    #[serde(default)]
    pub model_credentials: HashMap<String, String>,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default = "default_role_id")]
    pub default_role_id: String,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    /// Static-fallback tier of `ai_config_source` — the last resort when
    /// the process memory, distributed, and system-of-record tiers all
    /// miss. Empty by default: a fresh deployment must seed the
    /// `runtime_config` table or this file before any channel resolves.
    #[serde(default = "empty_ai_config_source")]
    pub ai_config_source: AiConfigSource,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            session: SessionConfig::default(),
            messaging_token: None,
            proxy: None,
            model_credentials: HashMap::new(),
            kv: KvConfig::default(),
            default_role_id: default_role_id(),
            telegram: None,
            ai_config_source: empty_ai_config_source(),
        }
    }
}

/// Telegram frontend configuration. Absent entirely when the gateway runs
/// without a messaging frontend (e.g. HTTP-only deployments).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Deny-by-default allowlist. Entries match a username (with or
    /// without leading `@`) or a numeric Telegram user id. `"*"` allows
    /// everyone.
    #[serde(default)]
    pub allow_users: Vec<String>,
    #[serde(default = "bool_true")]
    pub dm_allowed: bool,
    /// When true, group/supergroup messages are only processed when the
    /// bot is @mentioned.
    #[serde(default)]
    pub require_mention: bool,
}

fn bool_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_history")]
    pub max_history: u32,
    #[serde(default = "default_retention_count")]
    pub retention_count: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            retention_count: default_retention_count(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvConfig {
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub namespace: Option<String>,
}

fn default_port() -> u16 {
    8080
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_history() -> u32 {
    40
}
fn default_retention_count() -> u32 {
    200
}
fn default_role_id() -> String {
    "default".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.turnstile/turnstile.db")
}

impl StaticConfig {
    /// Load from `path` (or `~/.turnstile/turnstile.toml` if absent), with
    /// `TURNSTILE_*` env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TURNSTILE_").split("_"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.turnstile/turnstile.toml")
}

/// Distributed-cache tier boundary. The shipped implementation
/// ([`InProcessDistributedCache`]) is an in-process stand-in for an
/// external KV service; a networked implementation satisfies the same
/// trait without touching callers.
#[async_trait::async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn set_with_ttl(&self, key: &str, value: serde_json::Value, ttl_secs: i64);
}

/// System-of-record tier boundary, satisfied by `turnstile-store`'s
/// `runtime_config` table. Declared here (rather than depending on
/// `turnstile-store`) to keep `ConfigResolver` storage-agnostic.
#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, key: &str) -> std::result::Result<Option<serde_json::Value>, String>;
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// Three-tier runtime configuration lookup: process memory → distributed
/// cache → system of record → static fallback. See spec §4.1.
pub struct ConfigResolver {
    memory: Mutex<HashMap<String, CacheEntry>>,
    distributed: Arc<dyn DistributedCache>,
    store: Arc<dyn ConfigStore>,
}

impl ConfigResolver {
    pub fn new(distributed: Arc<dyn DistributedCache>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            distributed,
            store,
        }
    }

    /// Resolve `key`, falling back through the tiers in order and stopping
    /// at the first success. Never errors: a parse failure at any tier is
    /// logged and the next tier is consulted, down to `static_fallback`.
    pub async fn get<T>(&self, key: &str, static_fallback: T) -> T
    where
        T: Serialize + for<'de> Deserialize<'de> + Clone,
    {
        if let Some(value) = self.memory_hit(key) {
            match serde_json::from_value(value) {
                Ok(parsed) => return parsed,
                Err(e) => tracing::warn!(key, error = %e, "memory cache entry failed to parse"),
            }
        }

        if let Some(raw) = self.distributed.get(&format!("runtime_config:{key}")).await {
            match serde_json::from_value::<T>(raw.clone()) {
                Ok(parsed) => {
                    self.refresh_memory(key, raw);
                    return parsed;
                }
                Err(e) => tracing::warn!(key, error = %e, "distributed cache entry failed to parse"),
            }
        }

        match self.store.get_config(key).await {
            Ok(Some(raw)) => match serde_json::from_value::<T>(raw.clone()) {
                Ok(parsed) => {
                    self.refresh_memory(key, raw.clone());
                    let distributed = Arc::clone(&self.distributed);
                    let key = key.to_string();
                    tokio::spawn(async move {
                        distributed
                            .set_with_ttl(&format!("runtime_config:{key}"), raw, MEMORY_TTL_SECS)
                            .await;
                    });
                    return parsed;
                }
                Err(e) => tracing::warn!(key, error = %e, "system-of-record row failed to parse"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(key, error = %e, "system-of-record lookup failed"),
        }

        static_fallback
    }

    fn memory_hit(&self, key: &str) -> Option<serde_json::Value> {
        let guard = self.memory.lock().expect("config memory cache poisoned");
        guard.get(key).and_then(|entry| {
            if entry.expires_at > Utc::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    fn refresh_memory(&self, key: &str, value: serde_json::Value) {
        let mut guard = self.memory.lock().expect("config memory cache poisoned");
        guard.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Utc::now() + chrono::Duration::seconds(MEMORY_TTL_SECS),
            },
        );
    }

    /// Typed accessor: numeric keys coerce from either a JSON number or a
    /// numeric string.
    pub async fn get_number(&self, key: &str, static_fallback: f64) -> f64 {
        if let Some(value) = self.memory_hit(key) {
            if let Some(n) = coerce_number(&value) {
                return n;
            }
        }
        let as_value = self.get::<serde_json::Value>(key, serde_json::json!(static_fallback)).await;
        coerce_number(&as_value).unwrap_or(static_fallback)
    }

    /// Typed accessor: text keys require a non-empty string.
    pub async fn get_text(&self, key: &str, static_fallback: &str) -> String {
        let value = self
            .get::<serde_json::Value>(key, serde_json::json!(static_fallback))
            .await;
        match value.as_str() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => static_fallback.to_string(),
        }
    }

    /// `ai_config_source`: every profile must carry all seven named
    /// fields. An ill-formed row fails closed to `InvalidConfig` and the
    /// static fallback is returned.
    pub async fn get_ai_config_source(&self, static_fallback: AiConfigSource) -> AiConfigSource {
        let key = "ai_config_source";
        let raw = self
            .get::<serde_json::Value>(key, serde_json::to_value(&static_fallback).unwrap_or(serde_json::Value::Null))
            .await;
        match validate_ai_config_source(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(key, error = %e, "ai_config_source failed validation, using static fallback");
                static_fallback
            }
        }
    }
}

fn coerce_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn validate_ai_config_source(
    raw: serde_json::Value,
) -> std::result::Result<AiConfigSource, ConfigError> {
    let parsed: AiConfigSource = serde_json::from_value(raw).map_err(|e| ConfigError::InvalidConfig {
        key: "ai_config_source".to_string(),
        reason: e.to_string(),
    })?;
    for (channel_id, profiles) in &parsed.channels {
        if profiles.is_empty() {
            return Err(ConfigError::InvalidConfig {
                key: "ai_config_source".to_string(),
                reason: format!("channel '{channel_id}' has no profiles"),
            });
        }
    }
    Ok(parsed)
}

/// In-process stand-in for an external distributed cache, backed by a
/// `DashMap`. Entries expire lazily on read.
#[derive(Default)]
pub struct InProcessDistributedCache {
    entries: dashmap::DashMap<String, (serde_json::Value, DateTime<Utc>)>,
}

impl InProcessDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DistributedCache for InProcessDistributedCache {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.entries.get(key)?;
        let (value, expires_at) = entry.value().clone();
        if expires_at > Utc::now() {
            Some(value)
        } else {
            drop(entry);
            self.entries.remove(key);
            None
        }
    }

    async fn set_with_ttl(&self, key: &str, value: serde_json::Value, ttl_secs: i64) {
        self.entries
            .insert(key.to_string(), (value, Utc::now() + chrono::Duration::seconds(ttl_secs)));
    }
}
