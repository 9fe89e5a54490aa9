use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CustomerId, EventId, Money, ProductId, Result, SagaEventRecord, SagaExecution, SagaId,
    SagaState, StoreError, Version,
    store::{SagaMutation, SagaRepository, predecessor_states, validate_write},
};

const SAGA_COLUMNS: &str = "saga_id, current_state, customer_id, product_id, quantity, \
     amount_cents, payment_method, stock_reservation_id, payment_transaction_id, order_id, \
     error_message, created_at, updated_at, version";

/// SQLSTATE raised when a SERIALIZABLE transaction loses a conflict.
const SERIALIZATION_FAILURE: &str = "40001";

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::debug!("saga store migrations applied");
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<SagaExecution> {
        let state: String = row.try_get("current_state")?;
        let state = state
            .parse::<SagaState>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let quantity: i32 = row.try_get("quantity")?;
        let quantity = u32::try_from(quantity)
            .map_err(|_| StoreError::Corrupt(format!("negative quantity {quantity}")))?;

        Ok(SagaExecution::from_parts(
            SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            state,
            CustomerId::new(row.try_get::<String, _>("customer_id")?),
            ProductId::new(row.try_get::<String, _>("product_id")?),
            quantity,
            Money::from_cents(row.try_get("amount_cents")?),
            row.try_get("payment_method")?,
            row.try_get("stock_reservation_id")?,
            row.try_get("payment_transaction_id")?,
            row.try_get("order_id")?,
            row.try_get("error_message")?,
            row.try_get("created_at")?,
            row.try_get("updated_at")?,
            Version::new(row.try_get("version")?),
        ))
    }

    fn row_to_event(row: PgRow) -> Result<SagaEventRecord> {
        let event_type: String = row.try_get("event_type")?;
        Ok(SagaEventRecord {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            event_type: event_type.parse().map_err(StoreError::Corrupt)?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            sequence: row.try_get("sequence")?,
        })
    }

    async fn fetch_sagas(&self, sql: &str, binds: &[&str]) -> Result<Vec<SagaExecution>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_saga).collect()
    }

    /// Writes the mutable columns of `saga` inside `tx`, unconditionally.
    async fn write_locked(
        tx: &mut Transaction<'_, Postgres>,
        saga: &SagaExecution,
        version: Version,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE saga_executions
            SET current_state = $2, stock_reservation_id = $3, payment_transaction_id = $4,
                order_id = $5, error_message = $6, updated_at = $7, version = $8
            WHERE saga_id = $1
            "#,
        )
        .bind(saga.saga_id().as_uuid())
        .bind(saga.current_state().as_str())
        .bind(saga.stock_reservation_id())
        .bind(saga.payment_transaction_id())
        .bind(saga.order_id())
        .bind(saga.error_message())
        .bind(saga.updated_at())
        .bind(version.as_i64())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Maps a serialization failure onto a version conflict so callers retry.
    fn classify(error: sqlx::Error, saga_id: SagaId, expected: Version) -> StoreError {
        if let sqlx::Error::Database(ref db_err) = error
            && db_err.code().as_deref() == Some(SERIALIZATION_FAILURE)
        {
            tracing::debug!(%saga_id, "serializable transaction aborted");
            return StoreError::VersionConflict {
                saga_id,
                expected,
                actual: expected.next(),
            };
        }
        StoreError::Database(error)
    }
}

#[async_trait]
impl SagaRepository for PostgresSagaStore {
    async fn insert(&self, saga: &SagaExecution) -> Result<()> {
        let quantity = i32::try_from(saga.quantity())
            .map_err(|_| StoreError::Corrupt(format!("quantity {} too large", saga.quantity())))?;

        sqlx::query(
            r#"
            INSERT INTO saga_executions (saga_id, current_state, customer_id, product_id, quantity,
                amount_cents, payment_method, stock_reservation_id, payment_transaction_id,
                order_id, error_message, created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(saga.saga_id().as_uuid())
        .bind(saga.current_state().as_str())
        .bind(saga.customer_id().as_str())
        .bind(saga.product_id().as_str())
        .bind(quantity)
        .bind(saga.amount().cents())
        .bind(saga.payment_method())
        .bind(saga.stock_reservation_id())
        .bind(saga.payment_transaction_id())
        .bind(saga.order_id())
        .bind(saga.error_message())
        .bind(saga.created_at())
        .bind(saga.updated_at())
        .bind(saga.version().as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::AlreadyExists(saga.saga_id());
            }
            StoreError::Database(e)
        })?;

        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_executions WHERE saga_id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn update(
        &self,
        saga: &SagaExecution,
        expected_version: Version,
    ) -> Result<SagaExecution> {
        let saga_id = saga.saga_id();
        let allowed_from: Vec<String> = predecessor_states(saga.current_state())
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let next_version = expected_version.next();

        // The predicate carries the whole check: version, immutability of
        // terminal rows and the transition table.
        let result = sqlx::query(
            r#"
            UPDATE saga_executions
            SET current_state = $3, stock_reservation_id = $4, payment_transaction_id = $5,
                order_id = $6, error_message = $7, updated_at = $8, version = $9
            WHERE saga_id = $1 AND version = $2 AND current_state = ANY($10)
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(expected_version.as_i64())
        .bind(saga.current_state().as_str())
        .bind(saga.stock_reservation_id())
        .bind(saga.payment_transaction_id())
        .bind(saga.order_id())
        .bind(saga.error_message())
        .bind(saga.updated_at())
        .bind(next_version.as_i64())
        .bind(&allowed_from)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            let mut written = saga.clone();
            written.version = next_version;
            return Ok(written);
        }

        // Nothing matched; re-read to report why.
        let stored = self
            .get(saga_id)
            .await?
            .ok_or(StoreError::SagaNotFound(saga_id))?;
        if stored.is_terminal() {
            return Err(StoreError::TerminalSaga {
                saga_id,
                state: stored.current_state(),
            });
        }
        if stored.version() != expected_version {
            return Err(StoreError::VersionConflict {
                saga_id,
                expected: expected_version,
                actual: stored.version(),
            });
        }
        Err(StoreError::InvalidTransition {
            from: stored.current_state(),
            to: saga.current_state(),
        })
    }

    async fn update_exclusive(
        &self,
        saga_id: SagaId,
        mutation: SagaMutation,
    ) -> Result<SagaExecution> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_executions WHERE saga_id = $1 FOR UPDATE"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::classify(e, saga_id, Version::initial()))?;

        let stored = match row {
            Some(row) => Self::row_to_saga(row)?,
            None => return Err(StoreError::SagaNotFound(saga_id)),
        };

        // Dropping `tx` on an early return rolls it back.
        let mut proposed = stored.clone();
        mutation(&mut proposed)?;
        validate_write(&stored, &proposed)?;

        let next_version = stored.version().next();
        Self::write_locked(&mut tx, &proposed, next_version)
            .await
            .map_err(|e| Self::classify(e, saga_id, stored.version()))?;
        tx.commit()
            .await
            .map_err(|e| Self::classify(e, saga_id, stored.version()))?;

        proposed.version = next_version;
        Ok(proposed)
    }

    async fn find_active(&self) -> Result<Vec<SagaExecution>> {
        self.fetch_sagas(
            &format!(
                "SELECT {SAGA_COLUMNS} FROM saga_executions \
                 WHERE current_state NOT IN ('SALE_CONFIRMED', 'SALE_FAILED') \
                 ORDER BY created_at ASC, saga_id ASC"
            ),
            &[],
        )
        .await
    }

    async fn find_by_state(&self, state: SagaState) -> Result<Vec<SagaExecution>> {
        self.fetch_sagas(
            &format!(
                "SELECT {SAGA_COLUMNS} FROM saga_executions WHERE current_state = $1 \
                 ORDER BY created_at ASC, saga_id ASC"
            ),
            &[state.as_str()],
        )
        .await
    }

    async fn find_active_for_key(
        &self,
        customer_id: &CustomerId,
        product_id: &ProductId,
    ) -> Result<Vec<SagaExecution>> {
        self.fetch_sagas(
            &format!(
                "SELECT {SAGA_COLUMNS} FROM saga_executions \
                 WHERE customer_id = $1 AND product_id = $2 \
                 AND current_state NOT IN ('SALE_CONFIRMED', 'SALE_FAILED') \
                 ORDER BY created_at ASC, saga_id ASC"
            ),
            &[customer_id.as_str(), product_id.as_str()],
        )
        .await
    }

    async fn append_event(&self, event: SagaEventRecord) -> Result<i64> {
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO saga_events (event_id, saga_id, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING sequence
            "#,
        )
        .bind(event.event_id.as_uuid())
        .bind(event.saga_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(sequence)
    }

    async fn events_for_saga(&self, saga_id: SagaId) -> Result<Vec<SagaEventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, event_id, saga_id, event_type, payload, created_at
            FROM saga_events
            WHERE saga_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn state_counts(&self) -> Result<BTreeMap<SagaState, u64>> {
        let rows = sqlx::query(
            "SELECT current_state, COUNT(*) AS count FROM saga_executions GROUP BY current_state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let state: String = row.try_get("current_state")?;
            let state = state
                .parse::<SagaState>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let count: i64 = row.try_get("count")?;
            counts.insert(state, count.max(0) as u64);
        }
        Ok(counts)
    }
}
