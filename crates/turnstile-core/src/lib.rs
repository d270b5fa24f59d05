pub mod config;
pub mod error;
pub mod frontend;
pub mod ports;
pub mod types;

pub use config::{ConfigResolver, ConfigStore, DistributedCache, InProcessDistributedCache, StaticConfig};
pub use error::ConfigError;
pub use frontend::{DedupRing, FrontendAdapter};
pub use ports::{CharacterRepo, MessageLogRepo, SessionStore, SnapshotRepo};
pub use types::{
    AiConfigSource, Character, CharacterExtensions, Message, MessageLogRecord, ModelTier, Pipeline,
    Profile, Role, Session, SessionId, Snapshot, TurnType, UserPointer,
};
