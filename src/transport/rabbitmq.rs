use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties,
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;

use crate::envelope::{Destination, Envelope};
use crate::transport::{Sender, ToBytes};

/// RabbitMQ transport sender.
///
/// Publishes envelopes to a single exchange using a shared
/// `lapin::Channel`, with the envelope's queue destination as the routing
/// key.
///
/// ## Metadata mapping
///
/// - `Envelope.id` → AMQP `message_id`
/// - `Envelope.correlation_id` → AMQP `correlation_id`
/// - `Envelope.deliver_within` → AMQP per-message `expiration`, so the
///   broker also drops the message once the deadline passes; the
///   dispatcher has already accounted for time since release
/// - `Envelope.caused_by` → message header
/// - The payload bytes become the message body
///
/// The channel is wrapped in `Arc<Mutex<_>>` because `lapin::Channel` is
/// not `Sync` and `Sender::send` may be called concurrently.
pub struct RabbitMq<M> {
    channel: Arc<Mutex<lapin::Channel>>,
    exchange: String,
    msg: PhantomData<M>,
}

impl<M> RabbitMq<M> {
    /// Create a sender publishing to the given exchange.
    pub fn new(channel: lapin::Channel, exchange: impl Into<String>) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            exchange: exchange.into(),
            msg: PhantomData,
        }
    }
}

impl<M> Clone for RabbitMq<M> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            exchange: self.exchange.clone(),
            msg: self.msg,
        }
    }
}

#[async_trait]
impl<M> Sender<M> for RabbitMq<M>
where
    M: ToBytes + Send + Sync + 'static,
{
    type Error = lapin::Error;

    /// Publish an envelope to RabbitMQ.
    ///
    /// The call waits for both the publish and the broker confirmation
    /// (publisher confirms).
    async fn send(&mut self, envelope: Envelope<M>) -> Result<(), Self::Error> {
        let routing_key = match envelope.destination() {
            Destination::Queue(name) => name.clone(),
            other => {
                tracing::debug!(destination = ?other, "non-queue destination, publishing with empty routing key");
                String::new()
            }
        };

        let mut headers = FieldTable::default();
        if let Some(caused_by) = envelope.caused_by() {
            headers.insert(
                "caused-by".into(),
                AMQPValue::LongString(caused_by.to_string().into()),
            );
        }

        let mut properties = BasicProperties::default()
            .with_message_id(envelope.id().to_string().into())
            .with_headers(headers);
        if let Some(correlation_id) = envelope.correlation_id() {
            properties = properties.with_correlation_id(correlation_id.to_string().into());
        }
        if let Some(deadline) = envelope.deliver_within() {
            properties = properties.with_expiration(deadline.as_millis().to_string().into());
        }

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                &self.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                envelope.message().to_bytes(),
                properties,
            )
            .await?
            .await?;

        Ok(())
    }
}
