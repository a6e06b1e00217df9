//! Per-transaction state
//!
//! A record has two locks. `state` is held only for the instant of a status
//! transition, a registration or a read. `run` is held for a whole
//! orchestration so that concurrent `end`/`rollback` calls on the same
//! transaction queue behind each other; it also caches the terminal outcome.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::coord::participant::Participant;
use crate::coord::types::{Outcome, Phase, Status, TransactionId, TxContext};
use crate::core::errors::{CoordinatorError, Result};

struct RecordState {
    status: Status,
    participants: Vec<Arc<dyn Participant>>,
    attempts: BTreeMap<(usize, Phase), u32>,
    completed_at: Option<DateTime<Utc>>,
}

pub struct TransactionRecord {
    id: TransactionId,
    payload: Option<Arc<Value>>,
    created_at: DateTime<Utc>,
    state: RwLock<RecordState>,
    run: Arc<Mutex<Option<Outcome>>>,
}

impl TransactionRecord {
    pub fn new(id: TransactionId, payload: Option<Value>) -> Self {
        Self {
            id,
            payload: payload.map(Arc::new),
            created_at: Utc::now(),
            state: RwLock::new(RecordState {
                status: Status::Active,
                participants: Vec::new(),
                attempts: BTreeMap::new(),
                completed_at: None,
            }),
            run: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.state.read().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().completed_at
    }

    pub fn context(&self) -> TxContext {
        TxContext::new(self.id.clone(), self.payload.clone())
    }

    /// Enlist a participant; only allowed while `Active`. Returns its index.
    pub fn register(&self, participant: Arc<dyn Participant>) -> Result<usize> {
        let mut state = self.state.write();
        if state.status != Status::Active {
            return Err(CoordinatorError::TransactionClosed {
                id: self.id.clone(),
                status: state.status,
            });
        }
        state.participants.push(participant);
        Ok(state.participants.len() - 1)
    }

    /// Leave `Active` for `next` and freeze the participant list in one step
    pub(crate) fn start(&self, next: Status) -> Result<Vec<Arc<dyn Participant>>> {
        let mut state = self.state.write();
        if state.status != Status::Active {
            return Err(CoordinatorError::TransactionClosed {
                id: self.id.clone(),
                status: state.status,
            });
        }
        Self::apply(&self.id, &mut state, next)?;
        Ok(state.participants.clone())
    }

    /// Move to `next`, rejecting anything off the forward-only graph
    pub(crate) fn advance(&self, next: Status) -> Result<Status> {
        let mut state = self.state.write();
        let previous = state.status;
        Self::apply(&self.id, &mut state, next)?;
        Ok(previous)
    }

    fn apply(id: &TransactionId, state: &mut RecordState, next: Status) -> Result<()> {
        if !state.status.can_transition_to(next) {
            return Err(CoordinatorError::InvalidTransition {
                id: id.clone(),
                from: state.status,
                to: next,
            });
        }
        state.status = next;
        if next.is_terminal() {
            state.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Count one more call of `phase` on participant `index`
    pub(crate) fn note_attempt(&self, index: usize, phase: Phase) -> u32 {
        let mut state = self.state.write();
        let count = state.attempts.entry((index, phase)).or_insert(0);
        *count += 1;
        *count
    }

    pub fn attempts(&self, index: usize, phase: Phase) -> u32 {
        self.state
            .read()
            .attempts
            .get(&(index, phase))
            .copied()
            .unwrap_or(0)
    }

    /// Wait for exclusive use of the orchestration slot
    pub(crate) async fn lock_run(&self) -> OwnedMutexGuard<Option<Outcome>> {
        self.run.clone().lock_owned().await
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        let state = self.state.read();
        let names: Vec<String> = state
            .participants
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        let attempts = state
            .attempts
            .iter()
            .map(|(&(index, phase), &count)| AttemptCount {
                participant: names.get(index).cloned().unwrap_or_default(),
                phase,
                attempts: count,
            })
            .collect();

        TransactionSnapshot {
            id: self.id.clone(),
            status: state.status,
            participants: names,
            attempts,
            created_at: self.created_at,
            completed_at: state.completed_at,
        }
    }
}

/// Point-in-time view of a transaction for status queries
#[derive(Debug, Clone, Serialize)]
pub struct TransactionSnapshot {
    pub id: TransactionId,
    pub status: Status,
    pub participants: Vec<String>,
    pub attempts: Vec<AttemptCount>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptCount {
    pub participant: String,
    pub phase: Phase,
    pub attempts: u32,
}
