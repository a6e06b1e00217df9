//! Core types for coordinator-based transactions
//!
//! Identifiers, the status state machine and the per-call context handed to
//! participants.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::core::errors::{AbortCause, CoordinatorError, FailureKind, ParticipantFailure};

/// Opaque transaction identifier issued by the coordinator
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Build an id from a wall-clock timestamp and a per-coordinator counter
    pub(crate) fn generate(timestamp_ms: i64, counter: u64) -> Self {
        Self(format!("tx-{}-{}", timestamp_ms, counter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle of a transaction record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Active,
    Preparing,
    Prepared,
    PrepareFailed,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Preparing => "preparing",
            Status::Prepared => "prepared",
            Status::PrepareFailed => "prepare_failed",
            Status::Committing => "committing",
            Status::Committed => "committed",
            Status::RollingBack => "rolling_back",
            Status::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Committed | Status::RolledBack)
    }

    /// Edges of the forward-only status graph.
    ///
    /// `Active -> RollingBack` is the explicit abort path and
    /// `Prepared -> RollingBack` covers a commit decision that could not be
    /// logged.
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Active, RollingBack)
                | (Preparing, Prepared)
                | (Preparing, PrepareFailed)
                | (Prepared, Committing)
                | (Prepared, RollingBack)
                | (PrepareFailed, RollingBack)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, RolledBack)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Status::Active),
            "preparing" => Ok(Status::Preparing),
            "prepared" => Ok(Status::Prepared),
            "prepare_failed" => Ok(Status::PrepareFailed),
            "committing" => Ok(Status::Committing),
            "committed" => Ok(Status::Committed),
            "rolling_back" => Ok(Status::RollingBack),
            "rolled_back" => Ok(Status::RolledBack),
            _ => Err(format!("Unknown transaction status: {}", s)),
        }
    }
}

/// The three participant operations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Commit,
    Rollback,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context passed to every participant call (immutable, cheap to clone)
#[derive(Clone, Debug)]
pub struct TxContext {
    pub id: TransactionId,
    pub payload: Option<Arc<Value>>,
}

impl TxContext {
    pub fn new(id: TransactionId, payload: Option<Arc<Value>>) -> Self {
        Self { id, payload }
    }

    /// Deserialize a field of the transaction payload
    pub fn get_payload<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .payload
            .as_ref()
            .and_then(|p| p.get(key))
            .ok_or_else(|| anyhow::anyhow!("Payload field '{}' not found", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize payload field '{}': {}", key, e))
    }
}

/// Terminal result of an orchestration run, cached on the record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack {
        cause: AbortCause,
        failures: Vec<ParticipantFailure>,
    },
}

impl Outcome {
    pub fn status(&self) -> Status {
        match self {
            Outcome::Committed => Status::Committed,
            Outcome::RolledBack { .. } => Status::RolledBack,
        }
    }

    /// Result seen by `end`/`commit`
    pub fn into_commit_result(self, id: &TransactionId) -> crate::Result<()> {
        match self {
            Outcome::Committed => Ok(()),
            Outcome::RolledBack { cause, failures } => Err(CoordinatorError::TransactionAborted {
                id: id.clone(),
                cause,
                failures,
            }),
        }
    }

    /// Result seen by `rollback`: clean unless some Rollback call failed
    pub fn into_rollback_result(self, id: &TransactionId) -> crate::Result<()> {
        match self {
            Outcome::Committed => Err(CoordinatorError::AlreadyCommitted { id: id.clone() }),
            Outcome::RolledBack { cause, failures } => {
                if failures.iter().any(|f| f.kind == FailureKind::RollbackFailed) {
                    Err(CoordinatorError::TransactionAborted {
                        id: id.clone(),
                        cause,
                        failures,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }
}
