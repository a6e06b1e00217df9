//! Shared fixtures for the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use twophase::{
    Coordinator, CoordinatorConfig, ParticipantError, Participant, TransactionId, TxContext,
};

/// How a scripted participant answers Prepare
#[derive(Clone, Debug)]
pub enum PrepareScript {
    Accept,
    Reject,
    /// Fail transiently this many times, then accept
    Flaky(u32),
    /// Accept after sleeping
    Sleep(Duration),
}

/// In-memory participant with scripted failures and per-phase call counters
pub struct MockParticipant {
    name: String,
    prepare: PrepareScript,
    commit_failures: u32,
    rollback_failures: u32,
    pub prepare_calls: AtomicU32,
    pub commit_calls: AtomicU32,
    pub rollback_calls: AtomicU32,
    seen: Mutex<Vec<TransactionId>>,
}

impl MockParticipant {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prepare: PrepareScript::Accept,
            commit_failures: 0,
            rollback_failures: 0,
            prepare_calls: AtomicU32::new(0),
            commit_calls: AtomicU32::new(0),
            rollback_calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_prepare(mut self, script: PrepareScript) -> Self {
        self.prepare = script;
        self
    }

    /// First `n` Commit calls fail
    pub fn failing_commits(mut self, n: u32) -> Self {
        self.commit_failures = n;
        self
    }

    /// First `n` Rollback calls fail
    pub fn failing_rollbacks(mut self, n: u32) -> Self {
        self.rollback_failures = n;
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn prepares(&self) -> u32 {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u32 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u32 {
        self.rollback_calls.load(Ordering::SeqCst)
    }

    /// Distinct transaction ids this participant was called for
    pub fn seen(&self) -> Vec<TransactionId> {
        let mut seen = self.seen.lock().clone();
        seen.dedup();
        seen
    }

    fn observe(&self, ctx: &TxContext) {
        self.seen.lock().push(ctx.id.clone());
    }
}

#[async_trait]
impl Participant for MockParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, ctx: &TxContext) -> Result<(), ParticipantError> {
        self.observe(ctx);
        let call = self.prepare_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.prepare {
            PrepareScript::Accept => Ok(()),
            PrepareScript::Reject => Err(ParticipantError::rejected("vote no")),
            PrepareScript::Flaky(n) if call <= *n => {
                Err(ParticipantError::transient("temporarily unavailable"))
            }
            PrepareScript::Flaky(_) => Ok(()),
            PrepareScript::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
        }
    }

    async fn commit(&self, ctx: &TxContext) -> Result<(), ParticipantError> {
        self.observe(ctx);
        let call = self.commit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.commit_failures {
            return Err(ParticipantError::transient("commit write failed"));
        }
        Ok(())
    }

    async fn rollback(&self, ctx: &TxContext) -> Result<(), ParticipantError> {
        self.observe(ctx);
        let call = self.rollback_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.rollback_failures {
            return Err(ParticipantError::transient("rollback write failed"));
        }
        Ok(())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Fast backoff so retry-heavy tests stay quick
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .prepare_timeout(Duration::from_millis(500))
        .max_retries(3)
        .backoff(Duration::from_millis(1), Duration::from_millis(20))
        .retention(None)
        .build()
        .expect("valid test config")
}

pub fn coordinator() -> Coordinator {
    init_tracing();
    Coordinator::new(test_config()).expect("coordinator")
}
