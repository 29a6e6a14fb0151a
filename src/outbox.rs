//! Durable outbox store.
//!
//! Committed envelopes land in an outbox store and stay there until the
//! dispatcher releases them. The store doubles as the scheduler's queue: an
//! envelope with a `scheduled_at` is simply not *due* until that instant,
//! and it survives process restarts because it lives in the store, not in a
//! timer.
//!
//! ## Release time
//!
//! An entry's release time is its `scheduled_at` if present, otherwise its
//! insertion (commit) time. Release time drives both scheduling (`due`,
//! `next_due`) and the `deliver_within` deadline clock.
//!
//! ## Components
//!
//! - [`OutboxStore`]: backend trait for querying and removing entries
//! - [`OutboxEntry`]: an envelope paired with its computed release time
//!
//! Concrete backends: [`memory`] and, feature-gated, [`sqlx`].

pub mod memory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::envelope::Envelope;

/// Error returned by outbox store operations.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl OutboxError {
    /// Wrap a backend error.
    pub fn backend(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err.into(),
        }
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Outbox store error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// An envelope held by the store, paired with its release time.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry<M> {
    /// The stored envelope.
    pub envelope: Envelope<M>,
    /// When the envelope became (or becomes) visible for delivery.
    pub released_at: DateTime<Utc>,
}

/// Backend trait for the durable outbox store.
///
/// Implementations must keep entries across dispatcher restarts and order
/// due entries by release time.
#[async_trait]
pub trait OutboxStore<M>: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Entries whose release time has passed, ordered by release time.
    async fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry<M>>, Self::Error>;

    /// Earliest release time over all held entries, if any.
    async fn next_due(&self) -> Result<Option<DateTime<Utc>>, Self::Error>;

    /// Remove delivered or discarded entries.
    async fn remove(&self, ids: Vec<Uuid>) -> Result<(), Self::Error>;

    /// Cancel a held entry by envelope id.
    ///
    /// Returns `true` when an entry was removed. Cancelling an entry that
    /// was already released (or never existed) is a no-op returning `false`.
    async fn cancel(&self, id: Uuid) -> Result<bool, Self::Error>;
}
