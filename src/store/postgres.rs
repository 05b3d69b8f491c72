//! Postgres-backed instruction store
//!
//! Duplicate detection rides on the table's composite primary key; the
//! unique-violation from a racing insert surfaces as `StoreError::Duplicate`
//! instead of ever overwriting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;

use super::{Instruction, InstructionKey, InstructionStore, StoreError};
use crate::store::models::{CallbackFilter, InstructionPayload};
use crate::types::{InstructionKind, InstructionState};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

const INSTRUCTION_SELECT: &str = r#"system_id, operation_id, kind, state, foreign_system_id,
    filters, payload, result, error, created_at, last_update"#;

#[derive(Debug, FromRow)]
struct InstructionRow {
    system_id: i64,
    operation_id: String,
    kind: InstructionKind,
    state: InstructionState,
    foreign_system_id: Option<i64>,
    filters: serde_json::Value,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    last_update: DateTime<Utc>,
}

impl InstructionRow {
    fn into_instruction(self) -> Result<Instruction, StoreError> {
        let filters: Vec<CallbackFilter> = serde_json::from_value(self.filters)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;
        let payload: InstructionPayload = serde_json::from_value(self.payload)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;
        Ok(Instruction {
            key: InstructionKey::new(self.system_id as u64, self.operation_id),
            kind: self.kind,
            state: self.state,
            foreign_system_id: self.foreign_system_id.map(|v| v as u64),
            filters,
            payload,
            result: self.result,
            error: self.error,
            created_at: self.created_at,
            last_update: self.last_update,
        })
    }
}

pub struct PgInstructionStore {
    pool: PgPool,
}

impl PgInstructionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstructionStore for PgInstructionStore {
    async fn add(&self, record: &Instruction) -> Result<(), StoreError> {
        let filters = serde_json::to_value(&record.filters)
            .map_err(|e| StoreError::Database(sqlx::Error::Encode(Box::new(e))))?;
        let payload = serde_json::to_value(&record.payload)
            .map_err(|e| StoreError::Database(sqlx::Error::Encode(Box::new(e))))?;

        let result = sqlx::query(
            r#"
            INSERT INTO instructions (system_id, operation_id, kind, state, foreign_system_id,
                filters, payload, result, error, created_at, last_update)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.key.system_id as i64)
        .bind(&record.key.operation_id)
        .bind(record.kind)
        .bind(record.state)
        .bind(record.foreign_system_id.map(|v| v as i64))
        .bind(filters)
        .bind(payload)
        .bind(&record.result)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.last_update)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(record.key.to_string()))
            }
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    async fn update(&self, record: &Instruction) -> Result<(), StoreError> {
        let filters = serde_json::to_value(&record.filters)
            .map_err(|e| StoreError::Database(sqlx::Error::Encode(Box::new(e))))?;
        let payload = serde_json::to_value(&record.payload)
            .map_err(|e| StoreError::Database(sqlx::Error::Encode(Box::new(e))))?;

        // GREATEST keeps last_update monotone even if the wall clock slips
        let result = sqlx::query(
            r#"
            UPDATE instructions
            SET state = $3, filters = $4, payload = $5, result = $6, error = $7,
                last_update = GREATEST(NOW(), last_update)
            WHERE system_id = $1 AND operation_id = $2
            "#,
        )
        .bind(record.key.system_id as i64)
        .bind(&record.key.operation_id)
        .bind(record.state)
        .bind(filters)
        .bind(payload)
        .bind(&record.result)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.key.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, key: &InstructionKey) -> Result<(), StoreError> {
        let existing = self
            .find_by_key(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if !existing.state.is_deletable() {
            return Err(StoreError::DeleteNotAllowed(existing.state));
        }

        // Re-check the state inside the DELETE so a concurrent transition
        // between the lookup and the delete cannot orphan a ledger hold.
        let result = sqlx::query(
            r#"
            DELETE FROM instructions
            WHERE system_id = $1 AND operation_id = $2
              AND state IN ('confirmed', 'waitingForHold', 'failed')
            "#,
        )
        .bind(key.system_id as i64)
        .bind(&key.operation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DeleteNotAllowed(existing.state));
        }
        Ok(())
    }

    async fn find_by_key(&self, key: &InstructionKey) -> Result<Option<Instruction>, StoreError> {
        let query = format!(
            "SELECT {} FROM instructions WHERE system_id = $1 AND operation_id = $2",
            INSTRUCTION_SELECT
        );
        let row = sqlx::query_as::<_, InstructionRow>(&query)
            .bind(key.system_id as i64)
            .bind(&key.operation_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(InstructionRow::into_instruction).transpose()
    }

    async fn find_by_state(
        &self,
        kind: InstructionKind,
        state: InstructionState,
    ) -> Result<Vec<Instruction>, StoreError> {
        let query = format!(
            "SELECT {} FROM instructions WHERE kind = $1 AND state = $2 ORDER BY created_at ASC",
            INSTRUCTION_SELECT
        );
        let rows = sqlx::query_as::<_, InstructionRow>(&query)
            .bind(kind)
            .bind(state)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(InstructionRow::into_instruction)
            .collect()
    }

    async fn find_all_to_process(
        &self,
        kind: InstructionKind,
    ) -> Result<Vec<Instruction>, StoreError> {
        let query = format!(
            "SELECT {} FROM instructions
             WHERE kind = $1
               AND state NOT IN ('processed', 'cancelled', 'failed', 'timedOut', 'timedOutCommunication')
             ORDER BY created_at ASC",
            INSTRUCTION_SELECT
        );
        let rows = sqlx::query_as::<_, InstructionRow>(&query)
            .bind(kind)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(InstructionRow::into_instruction)
            .collect()
    }
}
