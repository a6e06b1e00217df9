//! Coordinator registry - the public transaction API
//!
//! Owns the map from transaction id to record. Records for different ids
//! never contend: the map is sharded and each record carries its own locks.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info};

use crate::coord::journal::Journal;
use crate::coord::orchestrator::PhaseOrchestrator;
use crate::coord::participant::Participant;
use crate::coord::record::{TransactionRecord, TransactionSnapshot};
use crate::coord::types::{Outcome, Status, TransactionId};
use crate::core::config::CoordinatorConfig;
use crate::core::errors::{CoordinatorError, Result};
use crate::storage::{LogEntry, TransactionLog, TxEvent};

type Records = Arc<DashMap<TransactionId, Arc<TransactionRecord>>>;

/// Which terminal operation the caller asked for
#[derive(Clone, Copy)]
enum Terminal {
    Commit,
    Rollback,
}

/// Two-phase-commit coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    records: Records,
    next_id: AtomicU64,
    orchestrator: Arc<PhaseOrchestrator>,
    journal: Journal,
}

impl Coordinator {
    /// Create a coordinator without a transaction log
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Create a coordinator that appends every transaction event to `log`
    pub fn with_log(config: CoordinatorConfig, log: Arc<dyn TransactionLog>) -> Result<Self> {
        Self::build(config, Some(log))
    }

    fn build(config: CoordinatorConfig, log: Option<Arc<dyn TransactionLog>>) -> Result<Self> {
        config.validate()?;
        let journal = Journal::new(log, config.event_capacity);
        let orchestrator = Arc::new(PhaseOrchestrator::new(&config, journal.clone()));
        Ok(Self {
            config,
            records: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            orchestrator,
            journal,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Start a transaction in `Active` status
    pub async fn begin(&self) -> TransactionId {
        self.insert(None).await
    }

    /// Start a transaction whose payload is handed to every participant call
    pub async fn begin_with_payload(&self, payload: Value) -> TransactionId {
        self.insert(Some(payload)).await
    }

    async fn insert(&self, payload: Option<Value>) -> TransactionId {
        let counter = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = TransactionId::generate(Utc::now().timestamp_millis(), counter);
        let record = Arc::new(TransactionRecord::new(id.clone(), payload));
        self.records.insert(id.clone(), record);
        self.journal.note(&id, TxEvent::Begin).await;
        debug!(tx_id = %id, "Transaction started");
        id
    }

    /// Enlist a participant in an `Active` transaction
    pub async fn register(&self, id: &TransactionId, participant: Arc<dyn Participant>) -> Result<()> {
        let record = self.lookup(id)?;
        let name = participant.name().to_string();
        record.register(participant)?;
        self.journal
            .note(id, TxEvent::Register { participant: name })
            .await;
        Ok(())
    }

    /// Run two-phase commit; `Ok` only if the transaction committed
    pub async fn end(&self, id: &TransactionId) -> Result<()> {
        self.finish(id, Terminal::Commit).await
    }

    /// Same as [`end`](Self::end)
    pub async fn commit(&self, id: &TransactionId) -> Result<()> {
        self.end(id).await
    }

    /// Abort an `Active` transaction, rolling back every registered participant
    pub async fn rollback(&self, id: &TransactionId) -> Result<()> {
        self.finish(id, Terminal::Rollback).await
    }

    pub fn status(&self, id: &TransactionId) -> Result<Status> {
        Ok(self.lookup(id)?.status())
    }

    pub fn snapshot(&self, id: &TransactionId) -> Result<TransactionSnapshot> {
        Ok(self.lookup(id)?.snapshot())
    }

    /// Stream of transaction events emitted after this call.
    ///
    /// The buffer holds `event_capacity` entries. A subscriber that falls
    /// further behind loses the oldest ones and gets `Overflowed(n)` from its
    /// next receive before the stream resumes.
    pub fn subscribe(&self) -> async_broadcast::Receiver<LogEntry> {
        self.journal.subscribe()
    }

    /// Number of records still held, terminal ones included
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop a terminal record now; returns whether one was removed
    pub async fn forget(&self, id: &TransactionId) -> bool {
        evict(&self.records, &self.journal, id).await
    }

    /// Evict every terminal record whose retention has elapsed
    pub async fn purge_terminal(&self) -> usize {
        let Some(retention) = self.config.retention else {
            return 0;
        };
        let now = Utc::now();
        let expired: Vec<TransactionId> = self
            .records
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .completed_at()
                    .and_then(|done| (now - done).to_std().ok())
                    .map(|elapsed| elapsed >= retention)
                    .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for id in expired {
            if evict(&self.records, &self.journal, &id).await {
                purged += 1;
            }
        }
        purged
    }

    fn lookup(&self, id: &TransactionId) -> Result<Arc<TransactionRecord>> {
        self.records
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoordinatorError::not_found(id))
    }

    async fn finish(&self, id: &TransactionId, terminal: Terminal) -> Result<()> {
        let record = self.lookup(id)?;
        // Queues behind any orchestration already running for this id
        let run = record.lock_run().await;
        if let Some(outcome) = run.as_ref() {
            debug!(tx_id = %id, status = %outcome.status(), "Returning cached outcome");
            return resolve(outcome.clone(), id, terminal);
        }

        let first = match terminal {
            Terminal::Commit => Status::Preparing,
            Terminal::Rollback => Status::RollingBack,
        };
        let participants = record.start(first)?;

        // Orchestration runs detached so that a caller giving up does not
        // leave the record stranded mid-protocol.
        let task = OrchestrationTask {
            orchestrator: self.orchestrator.clone(),
            record: record.clone(),
            records: self.records.clone(),
            journal: self.journal.clone(),
            retention: self.config.retention,
        };
        let handle = tokio::spawn(task.run(run, participants, terminal));
        match handle.await {
            Ok(outcome) => resolve(outcome, id, terminal),
            Err(e) => {
                error!(tx_id = %id, error = %e, "Orchestration task failed");
                Err(CoordinatorError::Internal(format!(
                    "orchestration of {} failed: {}",
                    id, e
                )))
            }
        }
    }
}

fn resolve(outcome: Outcome, id: &TransactionId, terminal: Terminal) -> Result<()> {
    match terminal {
        Terminal::Commit => outcome.into_commit_result(id),
        Terminal::Rollback => outcome.into_rollback_result(id),
    }
}

struct OrchestrationTask {
    orchestrator: Arc<PhaseOrchestrator>,
    record: Arc<TransactionRecord>,
    records: Records,
    journal: Journal,
    retention: Option<Duration>,
}

impl OrchestrationTask {
    async fn run(
        self,
        mut run: OwnedMutexGuard<Option<Outcome>>,
        participants: Vec<Arc<dyn Participant>>,
        terminal: Terminal,
    ) -> Outcome {
        let outcome = match terminal {
            Terminal::Commit => self.orchestrator.commit(&self.record, participants).await,
            Terminal::Rollback => self.orchestrator.abort(&self.record, participants).await,
        };
        *run = Some(outcome.clone());
        drop(run);
        info!(tx_id = %self.record.id(), status = %outcome.status(), "Transaction finished");

        if let Some(retention) = self.retention {
            let id = self.record.id().clone();
            let records = self.records;
            let journal = self.journal;
            tokio::spawn(async move {
                tokio::time::sleep(retention).await;
                evict(&records, &journal, &id).await;
            });
        }
        outcome
    }
}

async fn evict(records: &Records, journal: &Journal, id: &TransactionId) -> bool {
    let removed = records.remove_if(id, |_, record| record.is_terminal()).is_some();
    if removed {
        debug!(tx_id = %id, "Transaction evicted");
        journal.note(id, TxEvent::Evicted).await;
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::participant::FnParticipant;

    fn coordinator(retention: Option<Duration>) -> Coordinator {
        let config = CoordinatorConfig::builder()
            .prepare_timeout(Duration::from_millis(200))
            .backoff(Duration::from_millis(1), Duration::from_millis(10))
            .retention(retention)
            .build()
            .unwrap();
        Coordinator::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let coordinator = coordinator(None);
        let a = coordinator.begin().await;
        let b = coordinator.begin().await;
        assert_ne!(a, b);
        assert!(a.as_str().ends_with("-1"));
        assert!(b.as_str().ends_with("-2"));
        assert_eq!(coordinator.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let coordinator = coordinator(None);
        let ghost = TransactionId::from("tx-0-42");
        assert!(coordinator.status(&ghost).unwrap_err().is_not_found());
        assert!(coordinator.end(&ghost).await.unwrap_err().is_not_found());
        assert!(coordinator
            .register(&ghost, FnParticipant::new("a").into_arc())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_empty_transaction_commits() {
        let coordinator = coordinator(None);
        let id = coordinator.begin().await;
        coordinator.end(&id).await.unwrap();
        assert_eq!(coordinator.status(&id).unwrap(), Status::Committed);
    }

    #[tokio::test]
    async fn test_forget_only_terminal() {
        let coordinator = coordinator(None);
        let id = coordinator.begin().await;
        assert!(!coordinator.forget(&id).await);

        coordinator.end(&id).await.unwrap();
        assert!(coordinator.forget(&id).await);
        assert!(coordinator.status(&id).unwrap_err().is_not_found());
        assert!(coordinator.is_empty());
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let keep_forever = coordinator(None);
        let id = keep_forever.begin().await;
        keep_forever.end(&id).await.unwrap();
        assert_eq!(keep_forever.purge_terminal().await, 0);

        let short = coordinator(Some(Duration::from_millis(20)));
        let done = short.begin().await;
        let open = short.begin().await;
        short.end(&done).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The eviction timer may already have fired
        short.purge_terminal().await;
        assert!(short.status(&done).unwrap_err().is_not_found());
        assert_eq!(short.status(&open).unwrap(), Status::Active);
    }
}
