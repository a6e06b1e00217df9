//! Transaction coordination
//!
//! The registry hands out transaction ids and owns the records; the
//! orchestrator runs the two phases against a record's participants.

pub mod types;
pub mod participant;
pub mod record;
pub mod journal;
pub mod orchestrator;
pub mod registry;

pub use types::*;
pub use participant::{FnParticipant, Participant};
pub use record::{AttemptCount, TransactionRecord, TransactionSnapshot};
pub use journal::Journal;
pub use orchestrator::PhaseOrchestrator;
pub use registry::Coordinator;
