// Shared infrastructure: errors, configuration and retry

pub mod errors;
pub mod config;
pub mod retry;

// Re-export commonly used types
pub use errors::{
    AbortCause, CoordinatorError, FailureKind, ParticipantError, ParticipantFailure, Result,
};
pub use config::{CoordinatorConfig, CoordinatorConfigBuilder};
pub use retry::{Attempted, RetryPolicy};
