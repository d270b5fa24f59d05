use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load failed: {0}")]
    Load(String),

    #[error("config value at key '{key}' failed validation: {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("distributed cache error: {0}")]
    Cache(String),

    #[error("system-of-record error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConfigError {
    /// Short error code carried alongside `<InvalidConfig>`-style wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Load(_) => "CONFIG_LOAD_ERROR",
            ConfigError::InvalidConfig { .. } => "INVALID_CONFIG",
            ConfigError::Cache(_) => "CACHE_ERROR",
            ConfigError::Store(_) => "STORE_ERROR",
            ConfigError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
