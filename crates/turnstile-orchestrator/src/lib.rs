pub mod error;
pub mod orchestrator;

pub use error::OrchestratorError;
pub use orchestrator::{ChatOrchestrator, StreamUpdate};
