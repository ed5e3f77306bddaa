//! Persistence of recovery request transitions.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::request::RecoveryRequest;
use crate::error::StoreError;

/// Audit log of recovery requests. Every state change is saved.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    /// Insert or update the row for `request.request_id`.
    async fn save(&self, request: &RecoveryRequest) -> Result<(), StoreError>;
}

/// Keeps every saved version in memory. Used when no database is configured.
#[derive(Default)]
pub struct MemoryRecoveryStore {
    history: Mutex<Vec<RecoveryRequest>>,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every saved version, oldest first.
    pub fn history(&self) -> Vec<RecoveryRequest> {
        self.history.lock().clone()
    }

    /// Latest saved version of one request.
    pub fn latest(&self, request_id: u64) -> Option<RecoveryRequest> {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|r| r.request_id == request_id)
            .cloned()
    }
}

#[async_trait]
impl RecoveryStore for MemoryRecoveryStore {
    async fn save(&self, request: &RecoveryRequest) -> Result<(), StoreError> {
        self.history.lock().push(request.clone());
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgRecoveryStore;

#[cfg(feature = "postgres")]
mod pg {
    use async_trait::async_trait;
    use diesel::prelude::*;
    use diesel::sql_types::{BigInt, Integer, Nullable, Text, Timestamptz};

    use super::RecoveryStore;
    use crate::diesel_runtime::Database;
    use crate::error::StoreError;
    use crate::recovery::request::RecoveryRequest;

    /// Postgres `recovery_requests` table.
    pub struct PgRecoveryStore {
        db: Database,
    }

    impl PgRecoveryStore {
        /// Connect and create the audit table if needed.
        pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
            let db = Database::new(database_url)?;
            let store = Self { db };
            store.ensure_schema().await?;
            tracing::info!("recovery audit table ready");
            Ok(store)
        }

        async fn ensure_schema(&self) -> Result<(), StoreError> {
            self.db
                .run(|conn| {
                    diesel::sql_query(
                        r#"
                        CREATE TABLE IF NOT EXISTS recovery_requests (
                            request_id BIGINT PRIMARY KEY,
                            product TEXT NOT NULL,
                            producer_id INTEGER NOT NULL,
                            scope TEXT NOT NULL,
                            entity_id TEXT,
                            node_id INTEGER NOT NULL,
                            after_ms BIGINT,
                            outcome TEXT NOT NULL,
                            detail TEXT,
                            retry_of BIGINT,
                            requested_at TIMESTAMPTZ NOT NULL,
                            updated_at TIMESTAMPTZ NOT NULL
                        )
                        "#,
                    )
                    .execute(conn)?;
                    Ok(())
                })
                .await
        }
    }

    #[async_trait]
    impl RecoveryStore for PgRecoveryStore {
        async fn save(&self, request: &RecoveryRequest) -> Result<(), StoreError> {
            let r = request.clone();
            self.db
                .run(move |conn| {
                    diesel::sql_query(
                        r#"
                        INSERT INTO recovery_requests
                            (request_id, product, producer_id, scope, entity_id, node_id,
                             after_ms, outcome, detail, retry_of, requested_at, updated_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                        ON CONFLICT (request_id) DO UPDATE SET
                            outcome = EXCLUDED.outcome,
                            detail = EXCLUDED.detail,
                            updated_at = EXCLUDED.updated_at
                        "#,
                    )
                    .bind::<BigInt, _>(r.request_id as i64)
                    .bind::<Text, _>(&r.product)
                    .bind::<Integer, _>(r.producer_id as i32)
                    .bind::<Text, _>(r.scope.as_str())
                    .bind::<Nullable<Text>, _>(r.scope.entity_id())
                    .bind::<Integer, _>(r.node_id as i32)
                    .bind::<Nullable<BigInt>, _>(r.after)
                    .bind::<Text, _>(r.outcome.as_str())
                    .bind::<Nullable<Text>, _>(r.detail.as_deref())
                    .bind::<Nullable<BigInt>, _>(r.retry_of.map(|id| id as i64))
                    .bind::<Timestamptz, _>(r.requested_at)
                    .bind::<Timestamptz, _>(r.updated_at)
                    .execute(conn)?;
                    Ok(())
                })
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::request::{RecoveryOutcome, RecoveryScope};

    #[tokio::test]
    async fn test_memory_store_keeps_every_version() {
        let store = MemoryRecoveryStore::new();
        let mut request = RecoveryRequest::new(5, "pre", 3, RecoveryScope::Product, 1, None);

        store.save(&request).await.unwrap();
        request.transition(RecoveryOutcome::Completed, None);
        store.save(&request).await.unwrap();

        assert_eq!(store.history().len(), 2);
        assert_eq!(
            store.latest(5).unwrap().outcome,
            RecoveryOutcome::Completed
        );
    }
}
