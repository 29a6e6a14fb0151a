//! Envelope model and routing.
//!
//! An [`Envelope`] is the unit that moves through the system: a message
//! payload plus the delivery metadata the pipeline, outbox, and dispatcher
//! act on.
//!
//! ## Design
//!
//! - The payload type `M` is supplied by the application, typically as a
//!   closed enum covering every message the system exchanges
//! - Metadata fields are fixed at construction time; delivery behavior is
//!   chosen per send through [`DeliveryOptions`], not through mutation
//! - Every field serializes, so an envelope round-trips losslessly across a
//!   transport or storage boundary
//!
//! ## Lifecycle modes
//!
//! An envelope lives in exactly one of three modes: a plain send to its
//! destination, a scheduled send (invisible until `scheduled_at`), or a
//! request-reply exchange (carries a `correlation_id`). A `deliver_within`
//! deadline combines freely with any of them; its clock starts when the
//! envelope is *released*, not when it is created.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message payloads that can be routed by the pipeline.
///
/// The route is the registry key a handler pipeline is registered under,
/// typically one key per message variant.
pub trait Message: Send + Sync + 'static {
    /// Stable route key for this message.
    fn route(&self) -> &'static str;
}

/// Logical target of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// Dispatch to a locally registered handler pipeline.
    Local(String),
    /// Hand off to the transport under the given queue or topic name.
    Queue(String),
    /// Resolve the reply waiter matching the envelope's correlation id.
    Reply,
}

/// Per-send delivery modifiers.
///
/// The caller states, at send time, whether the message carries a delivery
/// deadline and whether it is withheld until a future point in time. Both
/// modifiers may be combined: a scheduled envelope's deadline clock starts
/// at its scheduled release, not at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    /// Discard the envelope if not handed to the transport within this
    /// duration of its release.
    pub deliver_within: Option<Duration>,
    /// Keep the envelope invisible to consumers until this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl DeliveryOptions {
    /// Set a delivery deadline relative to the envelope's release.
    pub fn deliver_within(mut self, deadline: Duration) -> Self {
        self.deliver_within = Some(deadline);
        self
    }

    /// Withhold delivery until the given instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Message container moving through the pipeline, outbox, and dispatcher.
///
/// Construction requires a payload and a destination; everything else is
/// optional metadata applied through [`DeliveryOptions`] or by the session
/// that stages the envelope. Fields are private so an envelope cannot be
/// reshaped after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    id: Uuid,
    message: M,
    destination: Destination,
    deliver_within: Option<Duration>,
    scheduled_at: Option<DateTime<Utc>>,
    correlation_id: Option<Uuid>,
    caused_by: Option<Uuid>,
}

impl<M> Envelope<M> {
    /// Create an envelope with a fresh id and no delivery modifiers.
    pub fn new(message: M, destination: Destination) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            destination,
            deliver_within: None,
            scheduled_at: None,
            correlation_id: None,
            caused_by: None,
        }
    }

    /// Apply per-send delivery options.
    pub fn with_options(mut self, options: DeliveryOptions) -> Self {
        self.deliver_within = options.deliver_within;
        self.scheduled_at = options.scheduled_at;
        self
    }

    /// Tag the envelope with the correlation id of a request-reply exchange.
    pub(crate) fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Record the inbound envelope whose handling produced this one.
    pub(crate) fn with_cause(mut self, caused_by: Uuid) -> Self {
        self.caused_by = Some(caused_by);
        self
    }

    /// Unique envelope id, generated at creation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The message payload.
    pub fn message(&self) -> &M {
        &self.message
    }

    /// Consume the envelope, returning the payload.
    pub fn into_message(self) -> M {
        self.message
    }

    /// Replace the payload while preserving every metadata field.
    ///
    /// Used by transport layers that re-encode the payload for the wire.
    pub fn map_message<N>(self, f: impl FnOnce(M) -> N) -> Envelope<N> {
        Envelope {
            id: self.id,
            message: f(self.message),
            destination: self.destination,
            deliver_within: self.deliver_within,
            scheduled_at: self.scheduled_at,
            correlation_id: self.correlation_id,
            caused_by: self.caused_by,
        }
    }

    /// Logical target of the envelope.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Relative delivery deadline, measured from release.
    pub fn deliver_within(&self) -> Option<Duration> {
        self.deliver_within
    }

    /// Instant before which the envelope stays invisible.
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    /// Correlation id linking a reply back to its originating request.
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Id of the inbound envelope whose handling produced this one.
    pub fn caused_by(&self) -> Option<Uuid> {
        self.caused_by
    }
}

/// Route-to-destination table, fixed at configuration time.
///
/// Maps a message route to the destination its envelopes are sent to.
/// Routes without an explicit entry dispatch locally, which is the common
/// case for commands handled in-process.
#[derive(Debug, Default)]
pub struct Router {
    routes: HashMap<&'static str, Destination>,
}

impl Router {
    /// Create a router with no explicit entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a route to an explicit destination.
    pub fn publish(mut self, route: &'static str, destination: Destination) -> Self {
        self.routes.insert(route, destination);
        self
    }

    /// Resolve the destination for a route, defaulting to local dispatch.
    pub fn destination_of(&self, route: &str) -> Destination {
        self.routes
            .get(route)
            .cloned()
            .unwrap_or_else(|| Destination::Local(route.to_owned()))
    }
}
