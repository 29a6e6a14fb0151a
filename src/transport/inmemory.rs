use std::sync::Arc;

use tokio::sync::Mutex;

use crate::envelope::Envelope;
use crate::transport::Sender;

/// In-memory transport for testing or local pipelines.
///
/// This transport records sent envelopes in a shared queue and implements
/// the [`Sender`] trait. It is useful for:
/// - Unit and integration testing
/// - Simulating delivery without a real broker
/// - Debugging message flows
pub struct InMemory<M> {
    msg_queue: Arc<Mutex<Vec<Envelope<M>>>>,
}

impl<M> Clone for InMemory<M> {
    fn clone(&self) -> Self {
        Self {
            msg_queue: Arc::clone(&self.msg_queue),
        }
    }
}

impl<M> Default for InMemory<M> {
    /// Create a new empty in-memory transport.
    fn default() -> Self {
        Self {
            msg_queue: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<M> InMemory<M> {
    /// Create a new empty in-memory transport.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: Clone> InMemory<M> {
    /// Snapshot of the envelopes "sent" so far, in send order.
    ///
    /// Clones of this transport share the queue, so a test can keep a
    /// handle and inspect what the dispatcher handed off.
    pub async fn sent(&self) -> Vec<Envelope<M>> {
        self.msg_queue.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl<M> Sender<M> for InMemory<M>
where
    M: std::fmt::Debug + Send + 'static,
{
    type Error = std::io::Error;

    /// "Send" an envelope by appending it to the in-memory queue.
    #[tracing::instrument(skip_all)]
    async fn send(&mut self, envelope: Envelope<M>) -> Result<(), Self::Error> {
        tracing::info!(
            envelope = %envelope.id(),
            destination = ?envelope.destination(),
            "Envelope sent to in-memory queue",
        );
        self.msg_queue.lock().await.push(envelope);
        Ok(())
    }
}
