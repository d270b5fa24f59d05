pub mod client;
pub mod error;
pub mod sse;

pub use client::{ChatRequest, ProfileDispatcher, UpstreamClient, UpstreamDispatch};
pub use error::UpstreamError;
pub use sse::StreamEvent;
