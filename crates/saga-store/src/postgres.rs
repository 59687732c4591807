use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, SagaId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, SagaState, SagaStatus, SagaStep, SagaStoreError,
    store::{SagaStore, validate_claim, validate_update},
};

const COLUMNS: &str = "saga_id, order_id, status, current_step, payload, started_at, updated_at";

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
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_state(row: PgRow) -> Result<SagaState> {
        let status: String = row.try_get("status")?;
        let current_step: Option<String> = row.try_get("current_step")?;

        Ok(SagaState {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            status: status.parse()?,
            current_step: current_step.map(|s| s.parse()).transpose()?,
            payload: row.try_get("payload")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    #[tracing::instrument(skip(self, payload), fields(saga_id = %saga_id))]
    async fn create(
        &self,
        saga_id: SagaId,
        order_id: OrderId,
        initial_step: SagaStep,
        payload: serde_json::Value,
    ) -> Result<SagaState> {
        let state = SagaState::new(saga_id, order_id, initial_step, payload);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO saga_states ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(state.saga_id.as_uuid())
        .bind(state.order_id.as_uuid())
        .bind(state.status.as_str())
        .bind(state.current_step.map(|s| s.as_str()))
        .bind(&state.payload)
        .bind(state.started_at)
        .bind(state.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("saga_states_pkey")
            {
                return SagaStoreError::AlreadyExists(saga_id);
            }
            SagaStoreError::Database(e)
        })?;

        Self::row_to_state(row)
    }

    async fn load(&self, saga_id: SagaId) -> Result<SagaState> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM saga_states WHERE saga_id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_state(row),
            None => Err(SagaStoreError::NotFound(saga_id)),
        }
    }

    #[tracing::instrument(
        skip(self, new_state),
        fields(saga_id = %saga_id, status = %new_state.status)
    )]
    async fn compare_and_update(
        &self,
        saga_id: SagaId,
        expected_status: SagaStatus,
        expected_step: Option<SagaStep>,
        new_state: SagaState,
    ) -> Result<SagaState> {
        validate_update(saga_id, expected_status, expected_step, &new_state)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE saga_states
            SET status = $4, current_step = $5, payload = $6, updated_at = $7
            WHERE saga_id = $1
              AND status = $2
              AND current_step IS NOT DISTINCT FROM $3
            RETURNING {COLUMNS}
            "#
        ))
        .bind(saga_id.as_uuid())
        .bind(expected_status.as_str())
        .bind(expected_step.map(|s| s.as_str()))
        .bind(new_state.status.as_str())
        .bind(new_state.current_step.map(|s| s.as_str()))
        .bind(&new_state.payload)
        .bind(new_state.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::row_to_state(row);
        }

        // Nothing matched: either the saga is gone or someone else moved it.
        let current = self.load(saga_id).await?;
        metrics::counter!("saga_store_conflicts_total").increment(1);
        Err(SagaStoreError::Conflict {
            saga_id,
            expected_status,
            expected_step,
            actual_status: current.status,
            actual_step: current.current_step,
        })
    }

    #[tracing::instrument(skip(self, expected), fields(saga_id = %expected.saga_id))]
    async fn claim(&self, expected: &SagaState, now: DateTime<Utc>) -> Result<SagaState> {
        validate_claim(expected)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE saga_states
            SET updated_at = $5
            WHERE saga_id = $1
              AND status = $2
              AND current_step IS NOT DISTINCT FROM $3
              AND updated_at = $4
            RETURNING {COLUMNS}
            "#
        ))
        .bind(expected.saga_id.as_uuid())
        .bind(expected.status.as_str())
        .bind(expected.current_step.map(|s| s.as_str()))
        .bind(expected.updated_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::row_to_state(row);
        }

        let current = self.load(expected.saga_id).await?;
        metrics::counter!("saga_store_claims_lost_total").increment(1);
        Err(SagaStoreError::StaleClaim {
            saga_id: expected.saga_id,
            expected_updated_at: expected.updated_at,
            actual_updated_at: current.updated_at,
        })
    }

    async fn find_stalled(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaState>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM saga_states
            WHERE status IN ('STARTED', 'IN_PROGRESS', 'FAILED')
              AND current_step IS NOT NULL
              AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(updated_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_state).collect()
    }
}
