// Core infrastructure modules
pub mod core;

pub mod coord;    // Transaction registry and two-phase orchestration
pub mod storage;  // Transaction log sinks and replay

// Re-exports for convenience
pub use core::errors::{
    AbortCause, CoordinatorError, FailureKind, ParticipantError, ParticipantFailure, Result,
};
pub use core::config::CoordinatorConfig;
pub use core::retry::RetryPolicy;
pub use coord::{
    Coordinator, FnParticipant, Participant, Phase, Status, TransactionId, TransactionSnapshot,
    TxContext,
};
pub use storage::{FileLog, LogEntry, MemoryLog, SledLog, TransactionLog, TxEvent};
