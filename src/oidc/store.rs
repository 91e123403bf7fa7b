//! Persistent client registry, written through an idempotent upsert.

use super::ClientDescriptor;
use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info_span, Instrument};

/// Transient failure reaching the persistent store.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StoreError(String);

impl StoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self(err.to_string())
    }
}

/// External persistent store for client descriptors.
#[async_trait]
pub trait ClientRegistryStore: Send + Sync {
    /// Create each descriptor if absent, update it if present and changed.
    ///
    /// Must be safe to call repeatedly with the same input, and must never
    /// remove records that are not part of `clients`: seeding is additive
    /// and corrective, not a full replace.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the store cannot be reached or the
    /// write fails.
    async fn upsert_all(&self, clients: &[ClientDescriptor]) -> Result<(), StoreError>;
}

const UPSERT_CLIENT_SQL: &str = r"
    INSERT INTO oidc_clients (client_id, client_secret, redirect_uris)
    VALUES ($1, $2, $3)
    ON CONFLICT (client_id) DO UPDATE
    SET client_secret = EXCLUDED.client_secret,
        redirect_uris = EXCLUDED.redirect_uris,
        updated_at = now()
    WHERE (oidc_clients.client_secret, oidc_clients.redirect_uris)
        IS DISTINCT FROM (EXCLUDED.client_secret, EXCLUDED.redirect_uris)";

/// `PostgreSQL` implementation over the `oidc_clients` table
/// (see `sql/schema.sql`).
pub struct PgClientRegistryStore {
    pool: PgPool,
}

impl PgClientRegistryStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClientRegistryStore for PgClientRegistryStore {
    async fn upsert_all(&self, clients: &[ClientDescriptor]) -> Result<(), StoreError> {
        // One transaction so a partially applied registry never becomes
        // visible to the authentication handler.
        let mut tx = self.pool.begin().await?;

        for client in clients {
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = UPSERT_CLIENT_SQL
            );

            sqlx::query(UPSERT_CLIENT_SQL)
                .bind(&client.client_id)
                .bind(client.client_secret.expose_secret())
                .bind(&client.redirect_uris)
                .execute(&mut *tx)
                .instrument(span)
                .await?;
        }

        tx.commit().await?;

        Ok(())
    }
}
