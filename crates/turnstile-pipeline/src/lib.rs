pub mod channel;
pub mod error;
pub mod registry;

pub use channel::{PipelineChannel, Trace};
pub use error::PipelineError;
pub use registry::ChannelRegistry;
