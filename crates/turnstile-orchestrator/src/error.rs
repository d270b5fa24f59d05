use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("session error: {0}")]
    Session(#[from] turnstile_sessions::SessionError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
