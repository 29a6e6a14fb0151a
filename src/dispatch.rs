//! Dispatch loop releasing committed envelopes.
//!
//! The [`Dispatcher`] is the scheduler's release process. It:
//!
//! - Sleeps until the store's next release time (bounded by a poll interval)
//! - Fetches due entries and enforces their `deliver_within` deadline
//! - Delivers each entry to its destination: a local handler pipeline, the
//!   reply waiter table, or the transport
//! - Removes entries once delivered or discarded
//! - Exposes lifecycle hooks for observability
//!
//! The loop holds no scheduling state of its own: everything lives in the
//! [`OutboxStore`], so a dispatcher can be cancelled and a new one started
//! over the same store. Entries that came due while no dispatcher was
//! running are released immediately on startup.
//!
//! The loop runs until a fatal store or transport error occurs, or a
//! [`CancellationToken`] is triggered.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::bus::MessageBus;
use crate::envelope::{Destination, Envelope, Message};
use crate::outbox::OutboxStore;
use crate::pipeline::InvocationOutcome;
use crate::session::UnitOfWork;
use crate::transport::{Transport, TransportError};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_FETCH_SIZE: usize = 100;

/// Envelope release loop.
///
/// Generic parameters:
/// - `M`: message payload type
/// - `U`: unit of work backing the bus
/// - `D`: outbox store implementation
/// - `T`: transport service type
/// - `HK`: hook implementation for lifecycle events
pub struct Dispatcher<M, U, D, T, HK>
where
    U: UnitOfWork<M>,
{
    bus: MessageBus<M, U>,
    store: D,
    transport: Transport<T>,
    hook: HK,
    poll_interval: Duration,
    fetch_size: usize,
}

impl<M, U, D, T> Dispatcher<M, U, D, T, DefaultDispatchHook>
where
    U: UnitOfWork<M>,
    D: OutboxStore<M>,
{
    /// Create a dispatcher with the default hook implementation.
    pub fn new(bus: MessageBus<M, U>, store: D, transport: Transport<T>) -> Self {
        Self {
            bus,
            store,
            transport,
            hook: DefaultDispatchHook,
            poll_interval: DEFAULT_POLL_INTERVAL,
            fetch_size: DEFAULT_FETCH_SIZE,
        }
    }
}

impl<M, U, D, T, HK> Dispatcher<M, U, D, T, HK>
where
    M: Message + Clone,
    U: UnitOfWork<M> + Send + Sync + 'static,
    D: OutboxStore<M>,
    T: Service<Envelope<M>> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
    HK: DispatchHook<M>,
{
    /// Replace the dispatch hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: DispatchHook<M>>(self, hook: HK2) -> Dispatcher<M, U, D, T, HK2> {
        Dispatcher {
            bus: self.bus,
            store: self.store,
            transport: self.transport,
            hook,
            poll_interval: self.poll_interval,
            fetch_size: self.fetch_size,
        }
    }

    /// Upper bound on how long the loop sleeps between store checks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Maximum number of entries fetched per wake.
    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.fetch_size = size;
        self
    }

    /// Run the release loop.
    ///
    /// Terminates gracefully on cancellation; a store or transport failure
    /// is fatal and returned. Handler failures of locally delivered
    /// envelopes are reported through the hook and do not stop the loop.
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), DispatchRunError> {
        self.hook.on_startup();

        loop {
            let sleep = self.next_wake().await?;
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    return Ok(());
                }
                _ = tokio::time::sleep(sleep) => {}
            }

            let now = Utc::now();
            let batch = self
                .store
                .due(now, self.fetch_size)
                .await
                .map_err(|e| DispatchRunError::store(e.into()))?;

            for entry in batch {
                if cancel.is_cancelled() {
                    self.hook.on_shutdown();
                    return Ok(());
                }

                let envelope = entry.envelope;
                self.hook.on_next_envelope(&envelope);

                if let Some(deadline) = envelope.deliver_within() {
                    let age = (now - entry.released_at).to_std().unwrap_or(Duration::ZERO);
                    if age > deadline {
                        self.hook.on_delivery_expired(&envelope);
                        self.remove(envelope.id()).await;
                        continue;
                    }
                }

                let id = envelope.id();
                match envelope.destination().clone() {
                    Destination::Reply => {
                        let resolved = self.bus.resolve_reply(envelope.clone()).await;
                        if resolved {
                            self.hook.on_delivered(&envelope);
                        } else {
                            self.hook.on_reply_discarded(&envelope);
                        }
                        self.remove(id).await;
                    }
                    Destination::Local(_) => {
                        let result = self.bus.dispatch_local(envelope.clone(), &cancel).await;
                        match result {
                            Ok(InvocationOutcome::Completed { .. }) => {
                                self.hook.on_delivered(&envelope)
                            }
                            Ok(InvocationOutcome::Aborted) => self.hook.on_aborted(&envelope),
                            Err(err) => self.hook.on_handler_error(&envelope, &err),
                        }
                        self.remove(id).await;
                    }
                    Destination::Queue(_) => {
                        let result = self.transport.send(envelope.clone()).await;
                        match result {
                            Ok(()) => {
                                self.hook.on_delivered(&envelope);
                                self.remove(id).await;
                            }
                            Err(err) => {
                                self.hook.on_transport_send_error(&err);
                                return Err(DispatchRunError::transport(err));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Time to sleep before the next release check.
    async fn next_wake(&self) -> Result<Duration, DispatchRunError> {
        let next = self
            .store
            .next_due()
            .await
            .map_err(|e| DispatchRunError::store(e.into()))?;
        let now = Utc::now();
        Ok(match next {
            Some(at) if at > now => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.poll_interval),
            Some(_) => Duration::ZERO,
            None => self.poll_interval,
        })
    }

    async fn remove(&self, id: uuid::Uuid) {
        if let Err(err) = self.store.remove(vec![id]).await {
            self.hook.on_store_remove_error(err.into().as_ref());
        }
    }
}

/// Error returned when the dispatch loop fails.
#[derive(Debug)]
pub struct DispatchRunError {
    context: tracing_error::SpanTrace,
    kind: DispatchRunErrorKind,
}

impl DispatchRunError {
    fn store(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: DispatchRunErrorKind::Store(error),
        }
    }

    fn transport(error: TransportError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: DispatchRunErrorKind::Transport(error),
        }
    }
}

/// Classification of dispatch loop errors.
#[derive(Debug)]
pub enum DispatchRunErrorKind {
    /// Errors originating from the outbox store.
    Store(tower::BoxError),
    /// Errors originating from the transport.
    Transport(TransportError),
}

impl std::fmt::Display for DispatchRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatchRunErrorKind::Store(err) => writeln!(f, "Store error: {err}"),
            DispatchRunErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchRunErrorKind::Store(err) => Some(err.as_ref()),
            DispatchRunErrorKind::Transport(err) => Some(err),
        }
    }
}

/// Hook trait for observing dispatch lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and test assertions.
pub trait DispatchHook<M>: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_next_envelope(&self, envelope: &Envelope<M>);
    fn on_delivered(&self, envelope: &Envelope<M>);
    fn on_delivery_expired(&self, envelope: &Envelope<M>);
    fn on_aborted(&self, envelope: &Envelope<M>);
    fn on_handler_error(&self, envelope: &Envelope<M>, error: &dyn std::error::Error);
    fn on_reply_discarded(&self, envelope: &Envelope<M>);
    fn on_transport_send_error(&self, error: &dyn std::error::Error);
    fn on_store_remove_error(&self, error: &dyn std::error::Error);
}

/// Default dispatch hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultDispatchHook;

impl<M> DispatchHook<M> for DefaultDispatchHook {
    fn on_startup(&self) {
        tracing::info!("Dispatcher is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Dispatcher is shutting down");
    }

    fn on_next_envelope(&self, envelope: &Envelope<M>) {
        tracing::debug!(envelope = %envelope.id(), "Envelope released");
    }

    fn on_delivered(&self, envelope: &Envelope<M>) {
        tracing::info!(envelope = %envelope.id(), "Envelope delivered");
    }

    fn on_delivery_expired(&self, envelope: &Envelope<M>) {
        tracing::warn!(envelope = %envelope.id(), "Delivery deadline exceeded, envelope discarded");
    }

    fn on_aborted(&self, envelope: &Envelope<M>) {
        tracing::info!(envelope = %envelope.id(), "Invocation aborted by a before stage");
    }

    fn on_handler_error(&self, envelope: &Envelope<M>, error: &dyn std::error::Error) {
        tracing::error!(envelope = %envelope.id(), ?error, "Handler failed for delivered envelope");
    }

    fn on_reply_discarded(&self, envelope: &Envelope<M>) {
        tracing::debug!(envelope = %envelope.id(), "Reply had no waiter, discarded");
    }

    fn on_transport_send_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error sending envelope through the transport");
    }

    fn on_store_remove_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Failed to remove envelope from the store");
    }
}
