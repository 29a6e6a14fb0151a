//! Handler pipelines and the continuation guard.
//!
//! A [`Pipeline`] wraps a handler body with ordered *before* and *after*
//! stages. Before stages resolve state the handler needs (loading an entity,
//! checking a precondition) and decide through a [`Continuation`] whether the
//! invocation proceeds at all. Stopping is deliberate and silent, not an
//! error.
//!
//! ## Execution order
//!
//! - Before stages run in registration order; the first [`Continuation::Stop`]
//!   short-circuits the whole invocation: no further before stages, no
//!   handler body, no after stages, nothing staged
//! - The handler body runs with the state accumulated by the before stages
//! - After stages run in registration order following a successful handler
//!   body; a handler error skips them and propagates
//!
//! Pipelines are stateless across invocations. The state type `S` is built
//! fresh (via `Default`) for every inbound envelope, and each invocation owns
//! its own [`UnitOfWorkSession`].
//!
//! Pipelines are registered explicitly, per route, in a [`HandlerRegistry`]
//! at startup. There is no runtime convention scanning.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::envelope::Message;
use crate::session::{UnitOfWork, UnitOfWorkSession};

/// Decision returned by a before stage.
///
/// `Continue` carries the (possibly enriched) pipeline state forward to the
/// next stage and ultimately to the handler body. `Stop` aborts the
/// invocation without it being an error.
#[derive(Debug)]
pub enum Continuation<S> {
    /// Proceed with the given state.
    Continue(S),
    /// Abort silently. The invocation completes successfully with no side
    /// effects committed.
    Stop,
}

/// Error raised by a stage or handler body.
///
/// Wraps the underlying cause and captures a tracing span backtrace for
/// diagnostics.
#[derive(Debug)]
pub struct HandlerError {
    context: SpanTrace,
    kind: HandlerErrorKind,
}

/// Classification of handler errors.
#[derive(Debug)]
pub enum HandlerErrorKind {
    /// A domain rule was violated by the handler body.
    Domain(tower::BoxError),
    /// The persistence collaborator failed.
    Storage(tower::BoxError),
    /// No pipeline is registered for the message's route.
    UnknownRoute(String),
    /// The invocation's cancellation signal fired.
    Cancelled,
}

impl HandlerError {
    /// Create a domain-rule error.
    pub fn domain(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: HandlerErrorKind::Domain(err.into()),
        }
    }

    /// Create a persistence error.
    pub fn storage(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: HandlerErrorKind::Storage(err.into()),
        }
    }

    pub(crate) fn unknown_route(route: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: HandlerErrorKind::UnknownRoute(route.to_owned()),
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: HandlerErrorKind::Cancelled,
        }
    }

    /// The error classification.
    pub fn kind(&self) -> &HandlerErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            HandlerErrorKind::Domain(err) => writeln!(f, "Domain error: {err}"),
            HandlerErrorKind::Storage(err) => writeln!(f, "Storage error: {err}"),
            HandlerErrorKind::UnknownRoute(route) => {
                writeln!(f, "No handler registered for route {route}")
            }
            HandlerErrorKind::Cancelled => writeln!(f, "Invocation cancelled"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            HandlerErrorKind::Domain(err) | HandlerErrorKind::Storage(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Stage running before the handler body.
///
/// Receives the inbound payload, the state accumulated so far, and the
/// invocation's ambient services (unit of work session, cancellation
/// signal). Returns a [`Continuation`] carrying the state forward, or
/// [`Continuation::Stop`] to abort the invocation silently.
#[async_trait]
pub trait BeforeStage<M, S, U>: Send + Sync
where
    U: UnitOfWork<M>,
{
    async fn run(
        &self,
        message: &M,
        state: S,
        session: &mut UnitOfWorkSession<M, U>,
        cancel: &CancellationToken,
    ) -> Result<Continuation<S>, HandlerError>;
}

/// Stage running after a successful handler body.
#[async_trait]
pub trait AfterStage<M, S, U>: Send + Sync
where
    U: UnitOfWork<M>,
{
    async fn run(
        &self,
        message: &M,
        state: &mut S,
        session: &mut UnitOfWorkSession<M, U>,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// The handler body.
///
/// Mutates entities through the session's transaction, stages outbound
/// envelopes through the session, and may return a reply payload for
/// request-reply invocations.
#[async_trait]
pub trait Handler<M, S, U>: Send + Sync
where
    U: UnitOfWork<M>,
{
    async fn handle(
        &self,
        message: &M,
        state: &mut S,
        session: &mut UnitOfWorkSession<M, U>,
        cancel: &CancellationToken,
    ) -> Result<Option<M>, HandlerError>;
}

/// Result of one pipeline invocation, before commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The handler body ran to completion. `replied` reports whether a
    /// correlated reply envelope was staged.
    Completed {
        /// Whether a reply envelope was staged for the inbound correlation.
        replied: bool,
    },
    /// A before stage returned [`Continuation::Stop`].
    Aborted,
}

/// Ordered before/after stages around one handler body.
pub struct Pipeline<M, S, U, H>
where
    U: UnitOfWork<M>,
{
    before: Vec<Box<dyn BeforeStage<M, S, U>>>,
    after: Vec<Box<dyn AfterStage<M, S, U>>>,
    handler: H,
}

impl<M, S, U, H> Pipeline<M, S, U, H>
where
    M: Message,
    S: Default + Send,
    U: UnitOfWork<M>,
    H: Handler<M, S, U>,
{
    /// Create a pipeline around a handler body, with no stages.
    pub fn new(handler: H) -> Self {
        Self {
            before: Vec::new(),
            after: Vec::new(),
            handler,
        }
    }

    /// Append a before stage. Stages run in registration order.
    pub fn before(mut self, stage: impl BeforeStage<M, S, U> + 'static) -> Self {
        self.before.push(Box::new(stage));
        self
    }

    /// Append an after stage. Stages run in registration order.
    pub fn after(mut self, stage: impl AfterStage<M, S, U> + 'static) -> Self {
        self.after.push(Box::new(stage));
        self
    }

    /// Run the pipeline for one inbound message.
    ///
    /// The caller owns commit and rollback of the session; this method only
    /// stages work.
    #[tracing::instrument(skip_all, fields(route = message.route()))]
    pub async fn invoke(
        &self,
        message: M,
        session: &mut UnitOfWorkSession<M, U>,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, HandlerError> {
        let mut state = S::default();

        for stage in &self.before {
            if cancel.is_cancelled() {
                return Err(HandlerError::cancelled());
            }
            match stage.run(&message, state, session, cancel).await? {
                Continuation::Continue(next) => state = next,
                Continuation::Stop => {
                    tracing::debug!("before stage stopped the invocation");
                    return Ok(InvocationOutcome::Aborted);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(HandlerError::cancelled());
        }

        let reply = self
            .handler
            .handle(&message, &mut state, session, cancel)
            .await?;

        for stage in &self.after {
            stage.run(&message, &mut state, session, cancel).await?;
        }

        let replied = match reply {
            Some(payload) => session.reply(payload),
            None => false,
        };

        Ok(InvocationOutcome::Completed { replied })
    }
}

/// Object-safe wrapper so pipelines with different state types can share a
/// registry.
#[async_trait]
pub(crate) trait ErasedPipeline<M, U>: Send + Sync
where
    U: UnitOfWork<M>,
{
    async fn invoke(
        &self,
        message: M,
        session: &mut UnitOfWorkSession<M, U>,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, HandlerError>;
}

#[async_trait]
impl<M, S, U, H> ErasedPipeline<M, U> for Pipeline<M, S, U, H>
where
    M: Message,
    S: Default + Send,
    U: UnitOfWork<M> + Send + Sync,
    H: Handler<M, S, U>,
{
    async fn invoke(
        &self,
        message: M,
        session: &mut UnitOfWorkSession<M, U>,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, HandlerError> {
        Pipeline::invoke(self, message, session, cancel).await
    }
}

/// Route-keyed set of handler pipelines, assembled at startup.
pub struct HandlerRegistry<M, U>
where
    U: UnitOfWork<M>,
{
    routes: HashMap<&'static str, Box<dyn ErasedPipeline<M, U>>>,
}

impl<M, U> Default for HandlerRegistry<M, U>
where
    U: UnitOfWork<M>,
{
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<M, U> HandlerRegistry<M, U>
where
    M: Message,
    U: UnitOfWork<M> + Send + Sync,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline under a route key.
    ///
    /// The route doubles as the handler's registration metadata: the stage
    /// set a message requires is exactly what was attached to its pipeline
    /// here.
    pub fn register<S, H>(mut self, route: &'static str, pipeline: Pipeline<M, S, U, H>) -> Self
    where
        S: Default + Send + 'static,
        H: Handler<M, S, U> + 'static,
        M: 'static,
        U: 'static,
    {
        self.routes.insert(route, Box::new(pipeline));
        self
    }

    pub(crate) fn get(&self, route: &str) -> Option<&dyn ErasedPipeline<M, U>> {
        self.routes.get(route).map(AsRef::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use uuid::Uuid;

    use crate::envelope::{Destination, Envelope, Router};
    use crate::outbox::memory::MemoryOutbox;
    use crate::session::memory::{Entity, MemoryUnitOfWork};

    #[derive(Debug, Clone, PartialEq)]
    enum TestMsg {
        Ping,
        Pong,
    }

    impl Message for TestMsg {
        fn route(&self) -> &'static str {
            match self {
                Self::Ping => "ping",
                Self::Pong => "pong",
            }
        }
    }

    #[derive(Debug, Clone)]
    struct NoEntity;

    impl Entity for NoEntity {
        fn id(&self) -> Uuid {
            Uuid::nil()
        }
    }

    type Work = MemoryUnitOfWork<NoEntity, TestMsg>;
    type Log = Arc<StdMutex<Vec<&'static str>>>;

    async fn new_session(correlated: bool) -> UnitOfWorkSession<TestMsg, Work> {
        let work = Arc::new(MemoryUnitOfWork::new(MemoryOutbox::new()));
        let router = Arc::new(Router::new());
        let mut inbound = Envelope::new(TestMsg::Ping, Destination::Local("ping".into()));
        if correlated {
            inbound = inbound.with_correlation(Uuid::new_v4());
        }
        UnitOfWorkSession::begin(work, router, &inbound)
            .await
            .unwrap()
    }

    struct Step {
        label: &'static str,
        stop: bool,
        log: Log,
    }

    #[async_trait]
    impl BeforeStage<TestMsg, (), Work> for Step {
        async fn run(
            &self,
            _message: &TestMsg,
            state: (),
            _session: &mut UnitOfWorkSession<TestMsg, Work>,
            _cancel: &CancellationToken,
        ) -> Result<Continuation<()>, HandlerError> {
            self.log.lock().unwrap().push(self.label);
            if self.stop {
                Ok(Continuation::Stop)
            } else {
                Ok(Continuation::Continue(state))
            }
        }
    }

    struct AfterStep {
        label: &'static str,
        log: Log,
    }

    #[async_trait]
    impl AfterStage<TestMsg, (), Work> for AfterStep {
        async fn run(
            &self,
            _message: &TestMsg,
            _state: &mut (),
            _session: &mut UnitOfWorkSession<TestMsg, Work>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            self.log.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    struct LogHandler {
        log: Log,
        reply: Option<TestMsg>,
        fail: bool,
    }

    #[async_trait]
    impl Handler<TestMsg, (), Work> for LogHandler {
        async fn handle(
            &self,
            _message: &TestMsg,
            _state: &mut (),
            _session: &mut UnitOfWorkSession<TestMsg, Work>,
            _cancel: &CancellationToken,
        ) -> Result<Option<TestMsg>, HandlerError> {
            if self.fail {
                return Err(HandlerError::domain("handler refused"));
            }
            self.log.lock().unwrap().push("handler");
            Ok(self.reply.clone())
        }
    }

    fn step(label: &'static str, log: &Log) -> Step {
        Step {
            label,
            stop: false,
            log: Arc::clone(log),
        }
    }

    #[tokio::test]
    async fn stages_run_in_registration_order() {
        let log: Log = Log::default();
        let pipeline = Pipeline::new(LogHandler {
            log: Arc::clone(&log),
            reply: None,
            fail: false,
        })
        .before(step("first", &log))
        .before(step("second", &log))
        .after(AfterStep {
            label: "cleanup",
            log: Arc::clone(&log),
        });

        let mut session = new_session(false).await;
        let outcome = pipeline
            .invoke(TestMsg::Ping, &mut session, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, InvocationOutcome::Completed { replied: false });
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first", "second", "handler", "cleanup"]
        );
    }

    #[tokio::test]
    async fn stop_short_circuits_the_invocation() {
        let log: Log = Log::default();
        let pipeline = Pipeline::new(LogHandler {
            log: Arc::clone(&log),
            reply: Some(TestMsg::Pong),
            fail: false,
        })
        .before(step("first", &log))
        .before(Step {
            label: "guard",
            stop: true,
            log: Arc::clone(&log),
        })
        .before(step("never", &log))
        .after(AfterStep {
            label: "cleanup",
            log: Arc::clone(&log),
        });

        let mut session = new_session(true).await;
        let outcome = pipeline
            .invoke(TestMsg::Ping, &mut session, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, InvocationOutcome::Aborted);
        assert_eq!(*log.lock().unwrap(), vec!["first", "guard"]);
        assert!(session.staged().is_empty());
    }

    #[tokio::test]
    async fn handler_error_skips_after_stages() {
        let log: Log = Log::default();
        let pipeline = Pipeline::new(LogHandler {
            log: Arc::clone(&log),
            reply: None,
            fail: true,
        })
        .before(step("first", &log))
        .after(AfterStep {
            label: "cleanup",
            log: Arc::clone(&log),
        });

        let mut session = new_session(false).await;
        let err = pipeline
            .invoke(TestMsg::Ping, &mut session, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), HandlerErrorKind::Domain(_)));
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn reply_is_staged_only_for_correlated_invocations() {
        let log: Log = Log::default();
        let pipeline = Pipeline::new(LogHandler {
            log: Arc::clone(&log),
            reply: Some(TestMsg::Pong),
            fail: false,
        });

        let mut session = new_session(true).await;
        let outcome = pipeline
            .invoke(TestMsg::Ping, &mut session, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, InvocationOutcome::Completed { replied: true });
        assert_eq!(session.staged().len(), 1);
        assert_eq!(session.staged()[0].destination(), &Destination::Reply);

        let mut session = new_session(false).await;
        let outcome = pipeline
            .invoke(TestMsg::Ping, &mut session, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, InvocationOutcome::Completed { replied: false });
        assert!(session.staged().is_empty());
    }
}
