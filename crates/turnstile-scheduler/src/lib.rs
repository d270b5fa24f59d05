pub mod engine;

pub use engine::{Decision, SchedulerState, StreamScheduler, FIRST_UPDATE_CHARS, REGULAR_INTERVAL_MS};
