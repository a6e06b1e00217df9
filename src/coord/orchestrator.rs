//! Phase orchestrator - drives one transaction through Prepare and then
//! Commit or Rollback
//!
//! Each participant call runs on its own tokio task. Prepare fans in under a
//! single deadline; Commit and Rollback fan in without one and are bounded by
//! the retry policy instead.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::coord::journal::Journal;
use crate::coord::participant::{invoke, Participant};
use crate::coord::record::TransactionRecord;
use crate::coord::types::{Outcome, Phase, Status};
use crate::core::config::CoordinatorConfig;
use crate::core::errors::{AbortCause, FailureKind, ParticipantError, ParticipantFailure};
use crate::core::retry::{Attempted, RetryPolicy};
use crate::storage::TxEvent;

type CallHandle = JoinHandle<Attempted<(), ParticipantError>>;

/// Result of the Prepare fan-in
struct PrepareReport {
    /// Indices of participants that voted yes
    prepared: Vec<usize>,
    failures: Vec<ParticipantFailure>,
}

pub struct PhaseOrchestrator {
    prepare_timeout: Duration,
    retry: RetryPolicy,
    journal: Journal,
}

impl PhaseOrchestrator {
    pub fn new(config: &CoordinatorConfig, journal: Journal) -> Self {
        Self {
            prepare_timeout: config.prepare_timeout,
            retry: RetryPolicy::from_config(config),
            journal,
        }
    }

    /// Run the full protocol. The record must already be in `Preparing`.
    pub async fn commit(
        &self,
        record: &Arc<TransactionRecord>,
        participants: Vec<Arc<dyn Participant>>,
    ) -> Outcome {
        let id = record.id().clone();
        self.journal
            .note(&id, TxEvent::Status { status: Status::Preparing })
            .await;
        info!(tx_id = %id, participants = participants.len(), "Preparing transaction");

        let report = self.prepare_all(record, &participants).await;

        if !report.failures.is_empty() {
            warn!(
                tx_id = %id,
                failed = report.failures.len(),
                prepared = report.prepared.len(),
                "Prepare failed, rolling back prepared participants"
            );
            self.transition(record, Status::PrepareFailed).await;
            self.journal.note(&id, TxEvent::Decision { commit: false }).await;
            self.transition(record, Status::RollingBack).await;
            let mut failures = report.failures;
            failures.extend(
                self.fan_out(record, &participants, &report.prepared, Phase::Rollback)
                    .await,
            );
            self.transition(record, Status::RolledBack).await;
            return Outcome::RolledBack {
                cause: AbortCause::PrepareFailed,
                failures,
            };
        }

        self.transition(record, Status::Prepared).await;
        let everyone: Vec<usize> = (0..participants.len()).collect();

        // The decision must be durable before any participant is told to commit
        if let Err(e) = self.journal.record(&id, TxEvent::Decision { commit: true }).await {
            error!(tx_id = %id, error = %e, "Could not log commit decision, rolling back");
            self.transition(record, Status::RollingBack).await;
            let failures = self
                .fan_out(record, &participants, &everyone, Phase::Rollback)
                .await;
            self.transition(record, Status::RolledBack).await;
            return Outcome::RolledBack {
                cause: AbortCause::DecisionNotLogged,
                failures,
            };
        }

        self.transition(record, Status::Committing).await;
        let mut failures = self
            .fan_out(record, &participants, &everyone, Phase::Commit)
            .await;

        if failures.is_empty() {
            self.transition(record, Status::Committed).await;
            info!(tx_id = %id, "Transaction committed");
            return Outcome::Committed;
        }

        // Participants that already committed cannot be undone here; they get
        // a Rollback anyway and must treat it as a no-op or compensate.
        error!(
            tx_id = %id,
            failed = failures.len(),
            "Commit failed after retries, rolling back every participant"
        );
        self.transition(record, Status::RollingBack).await;
        failures.extend(
            self.fan_out(record, &participants, &everyone, Phase::Rollback)
                .await,
        );
        self.transition(record, Status::RolledBack).await;
        Outcome::RolledBack {
            cause: AbortCause::CommitFailed,
            failures,
        }
    }

    /// Explicit abort of a transaction that never prepared. The record must
    /// already be in `RollingBack`.
    pub async fn abort(
        &self,
        record: &Arc<TransactionRecord>,
        participants: Vec<Arc<dyn Participant>>,
    ) -> Outcome {
        let id = record.id().clone();
        self.journal
            .note(&id, TxEvent::Status { status: Status::RollingBack })
            .await;
        info!(tx_id = %id, participants = participants.len(), "Rolling back on request");

        let everyone: Vec<usize> = (0..participants.len()).collect();
        let failures = self
            .fan_out(record, &participants, &everyone, Phase::Rollback)
            .await;
        self.transition(record, Status::RolledBack).await;
        Outcome::RolledBack {
            cause: AbortCause::Requested,
            failures,
        }
    }

    async fn prepare_all(
        &self,
        record: &Arc<TransactionRecord>,
        participants: &[Arc<dyn Participant>],
    ) -> PrepareReport {
        let deadline = Instant::now() + self.prepare_timeout;
        let indices: Vec<usize> = (0..participants.len()).collect();
        let handles = self.spawn_calls(record, participants, &indices, Phase::Prepare);

        // Late tasks are aborted so their responses are dropped and their
        // resources released.
        let results = join_all(handles.into_iter().map(|(index, mut handle)| async move {
            match timeout_at(deadline, &mut handle).await {
                Ok(joined) => (index, Some(joined)),
                Err(_) => {
                    handle.abort();
                    (index, None)
                }
            }
        }))
        .await;

        let mut report = PrepareReport {
            prepared: Vec::new(),
            failures: Vec::new(),
        };
        for (index, result) in results {
            let name = participants[index].name();
            match result {
                Some(Ok(Attempted { result: Ok(()), .. })) => report.prepared.push(index),
                Some(Ok(Attempted {
                    result: Err(e),
                    attempts,
                })) => {
                    let kind = match &e {
                        ParticipantError::Timeout(_) => FailureKind::PrepareTimeout,
                        _ => FailureKind::PrepareRejected,
                    };
                    warn!(tx_id = %record.id(), participant = name, attempts, error = %e, "Prepare rejected");
                    report
                        .failures
                        .push(ParticipantFailure::new(name, kind, attempts, e.to_string()));
                }
                Some(Err(join_error)) => {
                    error!(tx_id = %record.id(), participant = name, error = %join_error, "Prepare task failed");
                    report.failures.push(ParticipantFailure::new(
                        name,
                        FailureKind::PrepareRejected,
                        record.attempts(index, Phase::Prepare),
                        format!("participant task failed: {}", join_error),
                    ));
                }
                None => {
                    warn!(
                        tx_id = %record.id(),
                        participant = name,
                        timeout_ms = self.prepare_timeout.as_millis() as u64,
                        "Prepare timed out"
                    );
                    report.failures.push(ParticipantFailure::new(
                        name,
                        FailureKind::PrepareTimeout,
                        record.attempts(index, Phase::Prepare),
                        format!("no response within {:?}", self.prepare_timeout),
                    ));
                }
            }
        }
        report
    }

    /// Call `phase` on every participant in `targets` and wait for all of them
    async fn fan_out(
        &self,
        record: &Arc<TransactionRecord>,
        participants: &[Arc<dyn Participant>],
        targets: &[usize],
        phase: Phase,
    ) -> Vec<ParticipantFailure> {
        let handles = self.spawn_calls(record, participants, targets, phase);
        let results = join_all(
            handles
                .into_iter()
                .map(|(index, handle)| async move { (index, handle.await) }),
        )
        .await;

        let mut failures = Vec::new();
        for (index, result) in results {
            let name = participants[index].name();
            let (attempts, message) = match result {
                Ok(Attempted { result: Ok(()), attempts }) => {
                    debug!(tx_id = %record.id(), participant = name, %phase, attempts, "Participant finished phase");
                    continue;
                }
                Ok(Attempted {
                    result: Err(e),
                    attempts,
                }) => (attempts, e.to_string()),
                Err(join_error) => (
                    record.attempts(index, phase),
                    format!("participant task failed: {}", join_error),
                ),
            };
            error!(
                tx_id = %record.id(),
                participant = name,
                %phase,
                attempts,
                error = %message,
                "Participant failed after retries"
            );
            failures.push(ParticipantFailure::new(
                name,
                FailureKind::for_phase(phase),
                attempts,
                message,
            ));
        }
        failures
    }

    fn spawn_calls(
        &self,
        record: &Arc<TransactionRecord>,
        participants: &[Arc<dyn Participant>],
        targets: &[usize],
        phase: Phase,
    ) -> Vec<(usize, CallHandle)> {
        let ctx = record.context();
        targets
            .iter()
            .map(|&index| {
                let participant = participants[index].clone();
                let record = record.clone();
                let retry = self.retry.clone();
                let ctx = ctx.clone();
                let handle = tokio::spawn(async move {
                    let should_retry = |e: &ParticipantError| match phase {
                        // An explicit NACK during Prepare is final
                        Phase::Prepare => e.is_transient(),
                        Phase::Commit | Phase::Rollback => true,
                    };
                    retry
                        .execute_when(
                            |attempt| {
                                record.note_attempt(index, phase);
                                let participant = participant.clone();
                                let ctx = ctx.clone();
                                async move {
                                    if attempt > 1 {
                                        debug!(tx_id = %ctx.id, participant = participant.name(), %phase, attempt, "Retrying participant call");
                                    }
                                    invoke(participant.as_ref(), phase, &ctx).await
                                }
                            },
                            should_retry,
                        )
                        .await
                });
                (index, handle)
            })
            .collect()
    }

    async fn transition(&self, record: &TransactionRecord, next: Status) {
        if let Err(e) = record.advance(next) {
            // Only reachable through a bug in the sequencing above
            error!(tx_id = %record.id(), error = %e, "Rejected status transition");
            return;
        }
        self.journal
            .note(record.id(), TxEvent::Status { status: next })
            .await;
    }
}
