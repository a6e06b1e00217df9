//! Participant - the capability a coordinator drives through 2PC
//!
//! The coordinator only ever holds an `Arc<dyn Participant>`. Transports
//! (HTTP clients, in-process resources, mocks) implement the trait.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

use crate::coord::types::{Phase, TxContext};
use crate::core::errors::ParticipantError;

/// A resource manager enlisted in a transaction.
///
/// Every call may be repeated by the coordinator (retries), so
/// implementations must be idempotent per transaction id. A `rollback` may
/// also arrive after a successful `commit` when a sibling failed to commit;
/// treat it as a no-op or a compensating action.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Name used in logs and aggregate errors
    fn name(&self) -> &str;

    /// Vote on the transaction: `Ok` means "prepared and able to commit"
    async fn prepare(&self, ctx: &TxContext) -> Result<(), ParticipantError>;

    async fn commit(&self, ctx: &TxContext) -> Result<(), ParticipantError>;

    async fn rollback(&self, ctx: &TxContext) -> Result<(), ParticipantError>;
}

/// Dispatch one phase call
pub(crate) async fn invoke(
    participant: &dyn Participant,
    phase: Phase,
    ctx: &TxContext,
) -> Result<(), ParticipantError> {
    match phase {
        Phase::Prepare => participant.prepare(ctx).await,
        Phase::Commit => participant.commit(ctx).await,
        Phase::Rollback => participant.rollback(ctx).await,
    }
}

type PhaseFn = Arc<dyn Fn(TxContext) -> BoxFuture<'static, Result<(), ParticipantError>> + Send + Sync>;

/// Closure-backed participant; phases without a handler succeed
#[derive(Clone)]
pub struct FnParticipant {
    name: String,
    prepare: Option<PhaseFn>,
    commit: Option<PhaseFn>,
    rollback: Option<PhaseFn>,
}

impl FnParticipant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prepare: None,
            commit: None,
            rollback: None,
        }
    }

    pub fn on_prepare<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TxContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ParticipantError>> + Send + 'static,
    {
        self.prepare = Some(boxed(f));
        self
    }

    pub fn on_commit<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TxContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ParticipantError>> + Send + 'static,
    {
        self.commit = Some(boxed(f));
        self
    }

    pub fn on_rollback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TxContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ParticipantError>> + Send + 'static,
    {
        self.rollback = Some(boxed(f));
        self
    }

    /// Wrap into the handle type the coordinator registers
    pub fn into_arc(self) -> Arc<dyn Participant> {
        Arc::new(self)
    }

    async fn call(&self, handler: &Option<PhaseFn>, ctx: &TxContext) -> Result<(), ParticipantError> {
        match handler {
            Some(f) => f(ctx.clone()).await,
            None => Ok(()),
        }
    }
}

fn boxed<F, Fut>(f: F) -> PhaseFn
where
    F: Fn(TxContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ParticipantError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

#[async_trait]
impl Participant for FnParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, ctx: &TxContext) -> Result<(), ParticipantError> {
        self.call(&self.prepare, ctx).await
    }

    async fn commit(&self, ctx: &TxContext) -> Result<(), ParticipantError> {
        self.call(&self.commit, ctx).await
    }

    async fn rollback(&self, ctx: &TxContext) -> Result<(), ParticipantError> {
        self.call(&self.rollback, ctx).await
    }
}
