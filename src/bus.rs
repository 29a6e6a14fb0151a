//! Message bus entry points and request-reply correlation.
//!
//! The [`MessageBus`] is how callers put messages into the system:
//!
//! - [`send`](MessageBus::send) commits an envelope through the outbox and
//!   returns once it is durable; delivery happens later, via the dispatcher
//! - [`invoke`](MessageBus::invoke) runs the handler pipeline inline and,
//!   for request-reply messages, suspends the caller until a correlated
//!   reply arrives or the reply window elapses
//!
//! ## Reply correlation
//!
//! `invoke` generates a correlation id and registers a waiter with the
//! [`ReplyRouter`] before the pipeline runs. The handler's reply is staged
//! as a `Reply` envelope carrying that correlation id, becomes durable with
//! the commit, and is routed back by the dispatcher. The same path serves
//! handlers that answer instantly and handlers that answer after a long
//! suspension; the bus assumes nothing about handler latency.
//!
//! A before stage deciding to stop the invocation resolves the caller with
//! an explicit [`InvokeReply::Aborted`] rather than leaving the call to its
//! timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::envelope::{DeliveryOptions, Destination, Envelope, Message, Router};
use crate::pipeline::{HandlerError, HandlerErrorKind, HandlerRegistry, InvocationOutcome};
use crate::session::{UnitOfWork, UnitOfWorkSession};

/// Default window an `invoke` caller waits for a correlated reply.
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolution of a request-reply invocation.
#[derive(Debug, PartialEq)]
pub enum InvokeReply<M> {
    /// The correlated reply's payload.
    Reply(M),
    /// The handler completed without producing a reply.
    NoReply,
    /// A before stage stopped the invocation. Deliberate, not an error; no
    /// reply will ever come.
    Aborted,
}

/// Error returned by bus entry points.
#[derive(Debug)]
pub struct InvokeError {
    context: SpanTrace,
    kind: InvokeErrorKind,
}

/// Classification of bus errors.
#[derive(Debug)]
pub enum InvokeErrorKind {
    /// A stage or the handler body failed; nothing was committed.
    Handler(HandlerError),
    /// The unit of work failed to begin, commit, or roll back.
    Session(tower::BoxError),
    /// No correlated reply arrived within the reply window.
    Timeout,
    /// The invocation's cancellation signal fired before commit.
    Cancelled,
}

impl InvokeError {
    fn handler(err: HandlerError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InvokeErrorKind::Handler(err),
        }
    }

    fn session(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InvokeErrorKind::Session(err),
        }
    }

    fn timeout() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InvokeErrorKind::Timeout,
        }
    }

    fn cancelled() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InvokeErrorKind::Cancelled,
        }
    }

    /// The error classification.
    pub fn kind(&self) -> &InvokeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for InvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InvokeErrorKind::Handler(err) => writeln!(f, "Handler error: {err}"),
            InvokeErrorKind::Session(err) => writeln!(f, "Session error: {err}"),
            InvokeErrorKind::Timeout => writeln!(f, "No reply within the configured window"),
            InvokeErrorKind::Cancelled => writeln!(f, "Invocation cancelled"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for InvokeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            InvokeErrorKind::Handler(err) => Some(err),
            InvokeErrorKind::Session(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Correlation-id keyed table of reply waiters.
///
/// Exactly one reply resolves a waiter; duplicates and late arrivals are
/// discarded.
pub(crate) struct ReplyRouter<M> {
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<M>>>>,
}

impl<M> Clone for ReplyRouter<M> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<M> ReplyRouter<M> {
    fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn register(&self, correlation_id: Uuid) -> oneshot::Receiver<M> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id, tx);
        rx
    }

    async fn forget(&self, correlation_id: Uuid) {
        self.pending.lock().await.remove(&correlation_id);
    }

    /// Resolve the waiter for a correlation id. Returns `false` when the
    /// reply is a duplicate or arrived after resolution or timeout.
    pub(crate) async fn resolve(&self, correlation_id: Uuid, payload: M) -> bool {
        match self.pending.lock().await.remove(&correlation_id) {
            Some(waiter) => waiter.send(payload).is_ok(),
            None => false,
        }
    }
}

/// Entry point for sending and invoking messages.
///
/// Cheap to clone; clones share the registry, unit of work, router, and
/// pending-reply table.
pub struct MessageBus<M, U>
where
    U: UnitOfWork<M>,
{
    registry: Arc<HandlerRegistry<M, U>>,
    work: Arc<U>,
    router: Arc<Router>,
    replies: ReplyRouter<M>,
    reply_timeout: Duration,
}

impl<M, U> Clone for MessageBus<M, U>
where
    U: UnitOfWork<M>,
{
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            work: Arc::clone(&self.work),
            router: Arc::clone(&self.router),
            replies: self.replies.clone(),
            reply_timeout: self.reply_timeout,
        }
    }
}

impl<M, U> MessageBus<M, U>
where
    M: Message,
    U: UnitOfWork<M> + Send + Sync + 'static,
{
    /// Assemble a bus from its registered pipelines, unit of work, and
    /// routing table.
    pub fn new(registry: HandlerRegistry<M, U>, work: Arc<U>, router: Router) -> Self {
        Self {
            registry: Arc::new(registry),
            work,
            router: Arc::new(router),
            replies: ReplyRouter::new(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Override the reply window for `invoke`.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Commit a message through the outbox for later delivery.
    ///
    /// Returns the envelope id once the envelope is durable. For a
    /// scheduled send the id can be passed to the store's `cancel` before
    /// release.
    #[tracing::instrument(skip(self, message), fields(route = message.route()))]
    pub async fn send(&self, message: M, options: DeliveryOptions) -> Result<Uuid, InvokeError> {
        let destination = self.router.destination_of(message.route());
        let envelope = Envelope::new(message, destination).with_options(options);
        let id = envelope.id();

        let tx = self
            .work
            .begin()
            .await
            .map_err(|e| InvokeError::session(e.into()))?;
        self.work
            .commit(tx, vec![envelope])
            .await
            .map_err(|e| InvokeError::session(e.into()))?;

        Ok(id)
    }

    /// Run the message's handler pipeline inline and await its reply.
    ///
    /// The pipeline runs in a fresh unit of work session. On completion the
    /// session commits; a staged reply then flows back through the
    /// dispatcher and resolves this call, whether that takes microseconds
    /// or the better part of the reply window.
    ///
    /// Because the pipeline runs inline, a `scheduled_at` in `options` has
    /// no effect here: request-reply and scheduled delivery are separate
    /// lifecycles. Use [`send`](Self::send) to withhold a message.
    #[tracing::instrument(skip(self, message, cancel), fields(route = message.route()))]
    pub async fn invoke(
        &self,
        message: M,
        options: DeliveryOptions,
        cancel: &CancellationToken,
    ) -> Result<InvokeReply<M>, InvokeError> {
        if options.scheduled_at.is_some() {
            tracing::debug!("scheduled_at has no effect on an inline invocation, ignoring");
        }
        let correlation_id = Uuid::new_v4();
        let route = message.route();
        let envelope = Envelope::new(message, Destination::Local(route.to_owned()))
            .with_options(options)
            .with_correlation(correlation_id);

        let waiter = self.replies.register(correlation_id).await;

        match self.dispatch_local(envelope, cancel).await {
            Ok(InvocationOutcome::Completed { replied: true }) => {
                match tokio::time::timeout(self.reply_timeout, waiter).await {
                    Ok(Ok(payload)) => Ok(InvokeReply::Reply(payload)),
                    Ok(Err(_)) | Err(_) => {
                        self.replies.forget(correlation_id).await;
                        Err(InvokeError::timeout())
                    }
                }
            }
            Ok(InvocationOutcome::Completed { replied: false }) => {
                self.replies.forget(correlation_id).await;
                Ok(InvokeReply::NoReply)
            }
            Ok(InvocationOutcome::Aborted) => {
                self.replies.forget(correlation_id).await;
                Ok(InvokeReply::Aborted)
            }
            Err(err) => {
                self.replies.forget(correlation_id).await;
                Err(err)
            }
        }
    }

    /// Run the pipeline for one inbound envelope in a fresh session.
    ///
    /// Shared by `invoke` and by the dispatcher's local delivery.
    pub(crate) async fn dispatch_local(
        &self,
        envelope: Envelope<M>,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, InvokeError> {
        let mut session =
            UnitOfWorkSession::begin(Arc::clone(&self.work), Arc::clone(&self.router), &envelope)
                .await
                .map_err(|e| InvokeError::session(e.into()))?;

        let route = envelope.message().route();
        let Some(pipeline) = self.registry.get(route) else {
            rollback_quietly(session).await;
            return Err(InvokeError::handler(HandlerError::unknown_route(route)));
        };

        match pipeline
            .invoke(envelope.into_message(), &mut session, cancel)
            .await
        {
            Ok(outcome @ InvocationOutcome::Completed { .. }) => {
                if cancel.is_cancelled() {
                    rollback_quietly(session).await;
                    return Err(InvokeError::cancelled());
                }
                session
                    .commit()
                    .await
                    .map_err(|e| InvokeError::session(e.into()))?;
                Ok(outcome)
            }
            Ok(InvocationOutcome::Aborted) => {
                rollback_quietly(session).await;
                Ok(InvocationOutcome::Aborted)
            }
            Err(err) => {
                rollback_quietly(session).await;
                if matches!(err.kind(), HandlerErrorKind::Cancelled) {
                    Err(InvokeError::cancelled())
                } else {
                    Err(InvokeError::handler(err))
                }
            }
        }
    }

    /// Resolve the reply waiter for a correlated reply envelope.
    ///
    /// Returns `false` when the reply was discarded (duplicate, late, or
    /// uncorrelated).
    pub(crate) async fn resolve_reply(&self, envelope: Envelope<M>) -> bool {
        let Some(correlation_id) = envelope.correlation_id() else {
            tracing::debug!(envelope = %envelope.id(), "reply envelope without correlation id");
            return false;
        };
        self.replies
            .resolve(correlation_id, envelope.into_message())
            .await
    }
}

async fn rollback_quietly<M, U>(session: UnitOfWorkSession<M, U>)
where
    M: Message,
    U: UnitOfWork<M>,
{
    if let Err(err) = session.rollback().await {
        tracing::warn!(?err, "rollback failed while discarding a session");
    }
}
