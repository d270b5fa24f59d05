pub mod character;
pub mod error;
pub mod service;

pub use character::CharacterLoader;
pub use error::SessionError;
pub use service::{Resolution, SessionService};
