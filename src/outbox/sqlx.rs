//! SQLx Postgres backends for the unit of work and the outbox store.
//!
//! One table, `courier_outbox`, holds committed envelopes. The envelope is
//! stored losslessly as JSONB; the columns the release queries need
//! (`envelope_id`, `scheduled_at`, `inserted_at`) are extracted alongside.
//!
//! [`PgUnitOfWork`] gives the application a plain `sqlx` transaction for its
//! entity tables and inserts staged envelopes into the outbox table before
//! committing, so entity mutations and emitted envelopes share one
//! transaction. [`PgOutboxStore`] serves the dispatcher's release queries
//! over the same table.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::outbox::{OutboxEntry, OutboxStore};
use crate::session::UnitOfWork;

/// Unit of work backed by a Postgres transaction.
pub struct PgUnitOfWork<M> {
    pool: PgPool,
    _message_marker: PhantomData<fn() -> M>,
}

impl<M> Clone for PgUnitOfWork<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _message_marker: PhantomData,
        }
    }
}

impl<M> PgUnitOfWork<M> {
    /// Create a unit of work without touching the database.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self {
            pool,
            _message_marker: PhantomData,
        }
    }

    /// Create a unit of work and ensure the outbox table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }
}

#[async_trait]
impl<M> UnitOfWork<M> for PgUnitOfWork<M>
where
    M: Serialize + Send + Sync + 'static,
{
    type Tx = sqlx::Transaction<'static, sqlx::Postgres>;
    type Error = Error;

    async fn begin(&self) -> Result<Self::Tx, Self::Error> {
        Ok(self.pool.begin().await?)
    }

    #[tracing::instrument(skip_all, fields(staged = staged.len()))]
    async fn commit(&self, mut tx: Self::Tx, staged: Vec<Envelope<M>>) -> Result<(), Self::Error> {
        for envelope in staged {
            let body = serde_json::to_value(&envelope)?;
            sqlx::query(
                "INSERT INTO courier_outbox (envelope_id, envelope, scheduled_at) \
                 VALUES ($1, $2, $3)",
            )
            .bind(envelope.id())
            .bind(body)
            .bind(envelope.scheduled_at())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), Self::Error> {
        tx.rollback().await?;
        Ok(())
    }
}

/// Outbox store serving the dispatcher's release queries.
pub struct PgOutboxStore<M> {
    pool: PgPool,
    _message_marker: PhantomData<fn() -> M>,
}

impl<M> Clone for PgOutboxStore<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _message_marker: PhantomData,
        }
    }
}

impl<M> PgOutboxStore<M> {
    /// Create a store without touching the database.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self {
            pool,
            _message_marker: PhantomData,
        }
    }

    /// Create a store and ensure the outbox table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }
}

#[async_trait]
impl<M> OutboxStore<M> for PgOutboxStore<M>
where
    M: DeserializeOwned + Send + Sync + 'static,
{
    type Error = Error;

    async fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry<M>>, Self::Error> {
        let rows = sqlx::query(
            "SELECT envelope, COALESCE(scheduled_at, inserted_at) AS released_at \
             FROM courier_outbox \
             WHERE COALESCE(scheduled_at, inserted_at) <= $1 \
             ORDER BY COALESCE(scheduled_at, inserted_at), inserted_at \
             LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let body: serde_json::Value = row.try_get("envelope")?;
            let released_at: DateTime<Utc> = row.try_get("released_at")?;
            entries.push(OutboxEntry {
                envelope: serde_json::from_value(body)?,
                released_at,
            });
        }
        Ok(entries)
    }

    async fn next_due(&self) -> Result<Option<DateTime<Utc>>, Self::Error> {
        let next: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MIN(COALESCE(scheduled_at, inserted_at)) FROM courier_outbox")
                .fetch_one(&self.pool)
                .await?;
        Ok(next)
    }

    async fn remove(&self, ids: Vec<Uuid>) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM courier_outbox WHERE envelope_id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, Self::Error> {
        let result = sqlx::query("DELETE FROM courier_outbox WHERE envelope_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Ensures the outbox table exists.
async fn create_table(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS courier_outbox (
            envelope_id UUID PRIMARY KEY,
            envelope JSONB NOT NULL,
            scheduled_at TIMESTAMPTZ,
            inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// SQLx backend errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: PgBackendErrorKind,
}

/// Kinds of SQLx backend errors.
#[derive(Debug)]
pub enum PgBackendErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgBackendErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
            PgBackendErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgBackendErrorKind::Database(err) => Some(err),
            PgBackendErrorKind::Serde(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgBackendErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgBackendErrorKind::Serde(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DeliveryOptions, Destination};
    use chrono::Duration as ChronoDuration;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestMessage {
        value: String,
    }

    fn queued(value: &str) -> Envelope<TestMessage> {
        Envelope::new(
            TestMessage {
                value: value.into(),
            },
            Destination::Queue("q".into()),
        )
    }

    #[sqlx::test]
    async fn commit_makes_envelopes_due_and_scheduled_ones_invisible(pool: PgPool) {
        let work = PgUnitOfWork::try_new(pool.clone()).await.unwrap();
        let store = PgOutboxStore::<TestMessage>::new_uninitialized(pool);

        let soon = Utc::now() + ChronoDuration::minutes(5);
        let immediate = queued("now");
        let scheduled =
            queued("later").with_options(DeliveryOptions::default().scheduled_at(soon));

        let tx = work.begin().await.unwrap();
        work.commit(tx, vec![immediate.clone(), scheduled.clone()])
            .await
            .unwrap();

        let due = store.due(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].envelope, immediate);

        let due = store.due(soon, 10).await.unwrap();
        assert_eq!(due.len(), 2);
    }

    #[sqlx::test]
    async fn rollback_releases_nothing(pool: PgPool) {
        let work = PgUnitOfWork::try_new(pool.clone()).await.unwrap();
        let store = PgOutboxStore::<TestMessage>::new_uninitialized(pool);

        let tx = work.begin().await.unwrap();
        work.rollback(tx).await.unwrap();

        assert!(store.due(Utc::now(), 10).await.unwrap().is_empty());
        assert_eq!(store.next_due().await.unwrap(), None);
    }

    #[sqlx::test]
    async fn cancel_removes_a_held_entry_once(pool: PgPool) {
        let work = PgUnitOfWork::try_new(pool.clone()).await.unwrap();
        let store = PgOutboxStore::<TestMessage>::new_uninitialized(pool);

        let envelope = queued("cancel me");
        let id = envelope.id();
        let tx = work.begin().await.unwrap();
        work.commit(tx, vec![envelope]).await.unwrap();

        assert!(store.cancel(id).await.unwrap());
        assert!(!store.cancel(id).await.unwrap());
    }
}
