use thiserror::Error;

/// Process-bootstrap failures surfaced from `main`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(#[from] turnstile_core::ConfigError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid bind address: {0}")]
    Bind(#[from] std::net::AddrParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
