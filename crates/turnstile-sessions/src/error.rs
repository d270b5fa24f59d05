use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    /// `switchCharacter` was asked for a role that does not exist anywhere
    /// (system of record, bundled file, or built-in default).
    #[error("character not found: {role_id}")]
    CharacterNotFound { role_id: String },
}

pub type Result<T> = std::result::Result<T, SessionError>;
