use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::coord::types::{Phase, Status, TransactionId};

/// Errors returned by a participant from one of its phase calls
#[derive(Debug, Error)]
pub enum ParticipantError {
    /// Explicit refusal (a NACK). Never retried during Prepare.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Failure the participant expects to clear up on its own
    #[error("transient failure: {0}")]
    Transient(String),

    /// The participant gave up waiting on its own backend
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Anything else the participant implementation surfaced
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParticipantError {
    pub fn rejected<S: Into<String>>(reason: S) -> Self {
        Self::Rejected(reason.into())
    }

    pub fn transient<S: Into<String>>(reason: S) -> Self {
        Self::Transient(reason.into())
    }

    /// Whether a Prepare failing with this error may be attempted again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// What went wrong for one participant in one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PrepareRejected,
    PrepareTimeout,
    CommitFailed,
    RollbackFailed,
}

impl FailureKind {
    /// Failure kind for a participant that exhausted its attempts in `phase`
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Prepare => FailureKind::PrepareRejected,
            Phase::Commit => FailureKind::CommitFailed,
            Phase::Rollback => FailureKind::RollbackFailed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PrepareRejected => "prepare rejected",
            FailureKind::PrepareTimeout => "prepare timed out",
            FailureKind::CommitFailed => "commit failed",
            FailureKind::RollbackFailed => "rollback failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-participant failure collected during orchestration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantFailure {
    pub participant: String,
    pub kind: FailureKind,
    pub attempts: u32,
    pub message: String,
}

impl ParticipantFailure {
    pub fn new<P: Into<String>, M: Into<String>>(
        participant: P,
        kind: FailureKind,
        attempts: u32,
        message: M,
    ) -> Self {
        Self {
            participant: participant.into(),
            kind,
            attempts,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParticipantFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} after {} attempt(s): {}",
            self.participant, self.kind, self.attempts, self.message
        )
    }
}

/// Why a transaction ended in `RolledBack`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortCause {
    /// At least one participant rejected or timed out in Prepare
    PrepareFailed,
    /// At least one participant could not commit after retries
    CommitFailed,
    /// The commit decision could not be appended to the transaction log
    DecisionNotLogged,
    /// The caller asked for a rollback
    Requested,
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortCause::PrepareFailed => "prepare failed",
            AbortCause::CommitFailed => "commit failed",
            AbortCause::DecisionNotLogged => "commit decision not logged",
            AbortCause::Requested => "rollback requested",
        };
        f.write_str(s)
    }
}

/// Unified error type for the coordinator API
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error("Transaction not found: {id}")]
    TransactionNotFound { id: TransactionId },

    #[error("Transaction {id} is closed (status: {status})")]
    TransactionClosed { id: TransactionId, status: Status },

    #[error("Transaction {id} is already committed")]
    AlreadyCommitted { id: TransactionId },

    #[error("Transaction {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TransactionId,
        from: Status,
        to: Status,
    },

    /// Aggregate error for a transaction that ended in `RolledBack`
    #[error("Transaction {id} rolled back ({cause}){}", summarize(.failures))]
    TransactionAborted {
        id: TransactionId,
        cause: AbortCause,
        failures: Vec<ParticipantFailure>,
    },

    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn summarize(failures: &[ParticipantFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = failures.iter().map(|f| f.to_string()).collect();
    format!(": {}", parts.join("; "))
}

impl CoordinatorError {
    pub fn not_found(id: &TransactionId) -> Self {
        Self::TransactionNotFound { id: id.clone() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TransactionNotFound { .. })
    }

    /// True when any participant in an aborted transaction missed the prepare deadline
    pub fn is_timeout(&self) -> bool {
        self.failures()
            .iter()
            .any(|f| f.kind == FailureKind::PrepareTimeout)
    }

    /// Per-participant failures carried by an aborted transaction
    pub fn failures(&self) -> &[ParticipantFailure] {
        match self {
            Self::TransactionAborted { failures, .. } => failures,
            _ => &[],
        }
    }

    /// Names of the participants that caused or suffered the abort, deduplicated
    pub fn failing_participants(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for failure in self.failures() {
            if !names.contains(&failure.participant.as_str()) {
                names.push(&failure.participant);
            }
        }
        names
    }

    pub fn abort_cause(&self) -> Option<AbortCause> {
        match self {
            Self::TransactionAborted { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}

/// Result type alias using CoordinatorError
pub type Result<T> = std::result::Result<T, CoordinatorError>;
