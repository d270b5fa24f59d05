use thiserror::Error;

/// Errors surfaced by [`crate::UpstreamClient`].
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, UpstreamError>;
