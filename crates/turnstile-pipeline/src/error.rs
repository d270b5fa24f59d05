use thiserror::Error;

/// Errors recognized by the pipeline layer (spec.md's `<UpstreamExhausted>` /
/// `<ConfigurationError>` kinds).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("all profiles exhausted without a first token: {0}")]
    UpstreamExhausted(String),

    #[error("no channel configured for tier {tier}")]
    ConfigurationError { tier: String },

    #[error("channel {channel_id} has no profiles")]
    EmptyChannel { channel_id: String },

    #[error("generation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
