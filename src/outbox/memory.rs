//! An in-memory outbox store for testing or local usage.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::outbox::{OutboxEntry, OutboxStore};

#[derive(Debug)]
struct StoredRow<M> {
    envelope: Envelope<M>,
    inserted_at: DateTime<Utc>,
}

impl<M> StoredRow<M> {
    fn released_at(&self) -> DateTime<Utc> {
        self.envelope.scheduled_at().unwrap_or(self.inserted_at)
    }
}

/// In-memory outbox store.
///
/// Rows live in a shared `Vec`; the store handle is cheap to clone and all
/// clones observe the same rows, so a dispatcher can be stopped and a new
/// one started over the same store.
pub struct MemoryOutbox<M> {
    rows: Arc<Mutex<Vec<StoredRow<M>>>>,
}

impl<M> Clone for MemoryOutbox<M> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
        }
    }
}

impl<M> Default for MemoryOutbox<M> {
    fn default() -> Self {
        Self {
            rows: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<M> MemoryOutbox<M> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert committed envelopes, stamping the current instant as their
    /// insertion time.
    pub(crate) async fn insert(&self, envelopes: Vec<Envelope<M>>) {
        let inserted_at = Utc::now();
        let mut rows = self.rows.lock().await;
        rows.extend(envelopes.into_iter().map(|envelope| StoredRow {
            envelope,
            inserted_at,
        }));
    }
}

impl<M: Clone> MemoryOutbox<M> {
    /// Snapshot of every held envelope, in insertion order.
    pub async fn snapshot(&self) -> Vec<Envelope<M>> {
        let rows = self.rows.lock().await;
        rows.iter().map(|row| row.envelope.clone()).collect()
    }
}

#[async_trait]
impl<M> OutboxStore<M> for MemoryOutbox<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Error = Infallible;

    async fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry<M>>, Self::Error> {
        let rows = self.rows.lock().await;
        let mut due: Vec<OutboxEntry<M>> = rows
            .iter()
            .filter(|row| row.released_at() <= now)
            .map(|row| OutboxEntry {
                envelope: row.envelope.clone(),
                released_at: row.released_at(),
            })
            .collect();
        due.sort_by_key(|entry| entry.released_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn next_due(&self) -> Result<Option<DateTime<Utc>>, Self::Error> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().map(StoredRow::released_at).min())
    }

    async fn remove(&self, ids: Vec<Uuid>) -> Result<(), Self::Error> {
        let mut rows = self.rows.lock().await;
        rows.retain(|row| !ids.contains(&row.envelope.id()));
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, Self::Error> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|row| row.envelope.id() != id);
        Ok(rows.len() < before)
    }
}
