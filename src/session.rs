//! Unit of work and the per-invocation session.
//!
//! The transactional outbox hinges on one rule: entity mutations and the
//! envelopes a handler emits become durable together, or not at all. The
//! [`UnitOfWork`] trait is the seam where a persistence backend provides
//! that guarantee; the [`UnitOfWorkSession`] is the per-invocation object
//! that buffers staged envelopes until commit.
//!
//! ## Responsibilities
//!
//! - [`UnitOfWork`]: open a transaction, commit it together with a staged
//!   envelope set, or roll it back
//! - [`UnitOfWorkSession`]: own one transaction and the envelope staging
//!   buffer for exactly one inbound envelope
//!
//! Nothing staged through a session is visible to the dispatcher before the
//! session commits. A session is created per inbound envelope and consumed
//! by `commit` or `rollback`; it is never shared across invocations.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::envelope::{DeliveryOptions, Destination, Envelope, Message, Router};

/// Transaction boundary provided by a persistence backend.
///
/// `commit` must write the staged envelope set into the outbox store in the
/// same transaction as any entity mutations performed against `Tx`. If the
/// commit fails, no staged envelope may become visible.
#[async_trait]
pub trait UnitOfWork<M>: Send + Sync {
    /// Backend transaction value. Application code runs its entity reads and
    /// writes against this.
    type Tx: Send;
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Open a new transaction.
    async fn begin(&self) -> Result<Self::Tx, Self::Error>;

    /// Durably commit entity mutations and the staged envelopes, atomically.
    async fn commit(&self, tx: Self::Tx, staged: Vec<Envelope<M>>) -> Result<(), Self::Error>;

    /// Discard the transaction. Nothing becomes durable.
    async fn rollback(&self, tx: Self::Tx) -> Result<(), Self::Error>;
}

/// Error returned by session operations.
///
/// Wraps the backend error and captures a tracing span backtrace for
/// diagnostics.
#[derive(Debug)]
pub struct SessionError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl SessionError {
    fn backend(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Unit of work error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Per-invocation transaction plus envelope staging buffer.
///
/// Handlers and stages mutate entities through [`tx`](Self::tx) and stage
/// outbound envelopes through [`send`](Self::send) and friends. Staged
/// envelopes carry the inbound envelope's id as their causal link.
pub struct UnitOfWorkSession<M, U>
where
    U: UnitOfWork<M>,
{
    work: Arc<U>,
    router: Arc<Router>,
    tx: U::Tx,
    staged: Vec<Envelope<M>>,
    inbound_id: Uuid,
    inbound_correlation: Option<Uuid>,
}

impl<M, U> UnitOfWorkSession<M, U>
where
    M: Message,
    U: UnitOfWork<M>,
{
    /// Open a session for one inbound envelope.
    pub async fn begin(
        work: Arc<U>,
        router: Arc<Router>,
        inbound: &Envelope<M>,
    ) -> Result<Self, SessionError> {
        let tx = work
            .begin()
            .await
            .map_err(|e| SessionError::backend(e.into()))?;
        Ok(Self {
            work,
            router,
            tx,
            staged: Vec::new(),
            inbound_id: inbound.id(),
            inbound_correlation: inbound.correlation_id(),
        })
    }

    /// The backend transaction, for entity reads and writes.
    pub fn tx(&mut self) -> &mut U::Tx {
        &mut self.tx
    }

    /// Stage an envelope for delivery on commit. Returns its id.
    pub fn send(&mut self, message: M) -> Uuid {
        self.send_with(message, DeliveryOptions::default())
    }

    /// Stage an envelope with explicit delivery options. Returns its id.
    pub fn send_with(&mut self, message: M, options: DeliveryOptions) -> Uuid {
        let destination = self.router.destination_of(message.route());
        self.stage(Envelope::new(message, destination).with_options(options))
    }

    /// Stage an envelope withheld until the given instant. Returns its id,
    /// which can later be passed to the store's `cancel`.
    pub fn schedule(&mut self, message: M, at: DateTime<Utc>) -> Uuid {
        self.send_with(message, DeliveryOptions::default().scheduled_at(at))
    }

    /// Stage a reply to the inbound envelope's correlation id.
    ///
    /// Returns `false` (and stages nothing) when the inbound envelope was
    /// not a request-reply invocation.
    pub(crate) fn reply(&mut self, message: M) -> bool {
        match self.inbound_correlation {
            Some(correlation) => {
                self.stage(
                    Envelope::new(message, Destination::Reply).with_correlation(correlation),
                );
                true
            }
            None => {
                tracing::debug!(
                    inbound = %self.inbound_id,
                    "reply produced for an uncorrelated message, dropping"
                );
                false
            }
        }
    }

    fn stage(&mut self, envelope: Envelope<M>) -> Uuid {
        let envelope = envelope.with_cause(self.inbound_id);
        let id = envelope.id();
        self.staged.push(envelope);
        id
    }

    /// Envelopes staged so far.
    pub fn staged(&self) -> &[Envelope<M>] {
        &self.staged
    }

    /// Commit entity mutations and staged envelopes atomically.
    #[tracing::instrument(skip(self), fields(inbound = %self.inbound_id, staged = self.staged.len()))]
    pub async fn commit(self) -> Result<(), SessionError> {
        self.work
            .commit(self.tx, self.staged)
            .await
            .map_err(|e| SessionError::backend(e.into()))
    }

    /// Discard the session. No mutation persists, no envelope is released.
    pub async fn rollback(self) -> Result<(), SessionError> {
        self.work
            .rollback(self.tx)
            .await
            .map_err(|e| SessionError::backend(e.into()))
    }
}
