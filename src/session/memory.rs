//! In-memory unit of work for testing or local usage.
//!
//! Pairs a shared entity map with a [`MemoryOutbox`]. Commit applies the
//! transaction's buffered writes and inserts the staged envelopes while the
//! stores are locked, giving the same all-or-nothing observation a database
//! transaction would.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::outbox::memory::MemoryOutbox;
use crate::session::UnitOfWork;

/// Persisted domain values with a stable identity.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Identifier the entity is stored under.
    fn id(&self) -> Uuid;
}

/// Buffered writes for one in-memory transaction.
///
/// Reads through the owning [`MemoryUnitOfWork`] see these writes before
/// they are committed; other invocations do not.
#[derive(Debug)]
pub struct MemoryTx<E> {
    writes: Vec<E>,
}

// Manual impl: an empty transaction needs nothing from `E`.
impl<E> Default for MemoryTx<E> {
    fn default() -> Self {
        Self { writes: Vec::new() }
    }
}

/// In-memory unit of work over an entity map and an outbox store.
pub struct MemoryUnitOfWork<E, M> {
    entities: Arc<Mutex<HashMap<Uuid, E>>>,
    outbox: MemoryOutbox<M>,
}

impl<E, M> Clone for MemoryUnitOfWork<E, M> {
    fn clone(&self) -> Self {
        Self {
            entities: Arc::clone(&self.entities),
            outbox: self.outbox.clone(),
        }
    }
}

impl<E, M> MemoryUnitOfWork<E, M>
where
    E: Entity,
{
    /// Create a unit of work committing envelopes into the given store.
    pub fn new(outbox: MemoryOutbox<M>) -> Self {
        Self {
            entities: Arc::new(Mutex::new(HashMap::new())),
            outbox,
        }
    }

    /// Insert an entity directly, outside any transaction.
    ///
    /// Test setup helper, equivalent to a previously committed write.
    pub async fn seed(&self, entity: E) {
        self.entities.lock().await.insert(entity.id(), entity);
    }

    /// Load an entity, observing the transaction's own pending writes first.
    pub async fn load(&self, id: Uuid, tx: &MemoryTx<E>) -> Option<E> {
        if let Some(entity) = tx.writes.iter().rev().find(|e| e.id() == id) {
            return Some(entity.clone());
        }
        self.entities.lock().await.get(&id).cloned()
    }

    /// Buffer an entity write in the transaction.
    pub fn store(&self, entity: E, tx: &mut MemoryTx<E>) {
        tx.writes.push(entity);
    }

    /// Read the committed state of an entity, ignoring any transaction.
    pub async fn fetch(&self, id: Uuid) -> Option<E> {
        self.entities.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl<E, M> UnitOfWork<M> for MemoryUnitOfWork<E, M>
where
    E: Entity,
    M: Send + Sync + 'static,
{
    type Tx = MemoryTx<E>;
    type Error = Infallible;

    async fn begin(&self) -> Result<Self::Tx, Self::Error> {
        Ok(MemoryTx::default())
    }

    async fn commit(&self, tx: Self::Tx, staged: Vec<Envelope<M>>) -> Result<(), Self::Error> {
        let mut entities = self.entities.lock().await;
        for entity in tx.writes {
            entities.insert(entity.id(), entity);
        }
        // Entities lock is held until the envelopes are inserted, so no task
        // observes the mutation without the staged set.
        self.outbox.insert(staged).await;
        drop(entities);
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), Self::Error> {
        drop(tx);
        Ok(())
    }
}
