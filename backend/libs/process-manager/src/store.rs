//! Postgres persistence for process instances and their event log.

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::ProcessError;
use crate::model::{ProcessEvent, ProcessInstance, ProcessLogEntry, ProcessStatus};

pub struct ProcessStore {
    pool: PgPool,
}

const INSTANCE_COLUMNS: &str = "process_id, process_type, business_key, status, current_step, \
     data, retries, created_at, updated_at";

impl ProcessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_instance(row: &PgRow) -> Result<ProcessInstance, sqlx::Error> {
        let status_text: String = row.try_get("status")?;
        let status = ProcessStatus::parse(&status_text).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown process status: {status_text}").into())
        })?;

        Ok(ProcessInstance {
            process_id: row.try_get("process_id")?,
            process_type: row.try_get("process_type")?,
            business_key: row.try_get("business_key")?,
            status,
            current_step: row.try_get("current_step")?,
            data: row.try_get("data")?,
            retries: row.try_get("retries")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_log_entry(row: &PgRow) -> Result<ProcessLogEntry, ProcessError> {
        let event_json: Value = row.try_get("event").map_err(ProcessError::Database)?;
        let event: ProcessEvent = serde_json::from_value(event_json)?;
        Ok(ProcessLogEntry {
            seq: row.try_get("seq").map_err(ProcessError::Database)?,
            at: row.try_get("at").map_err(ProcessError::Database)?,
            event,
        })
    }

    pub async fn insert_instance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        instance: &ProcessInstance,
    ) -> Result<(), ProcessError> {
        sqlx::query(
            r#"
            INSERT INTO process_instance
                (process_id, process_type, business_key, status, current_step, data, retries, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            "#,
        )
        .bind(instance.process_id)
        .bind(&instance.process_type)
        .bind(&instance.business_key)
        .bind(instance.status.as_str())
        .bind(&instance.current_step)
        .bind(&instance.data)
        .bind(instance.retries)
        .execute(&mut **tx)
        .await?;

        debug!(
            process_id = %instance.process_id,
            process_type = %instance.process_type,
            business_key = %instance.business_key,
            "Process instance created"
        );
        Ok(())
    }

    /// Persist the derived materialization after applying events.
    pub async fn update_instance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        instance: &ProcessInstance,
    ) -> Result<(), ProcessError> {
        let result = sqlx::query(
            r#"
            UPDATE process_instance
            SET status = $2, current_step = $3, data = $4, retries = $5, updated_at = NOW()
            WHERE process_id = $1
            "#,
        )
        .bind(instance.process_id)
        .bind(instance.status.as_str())
        .bind(&instance.current_step)
        .bind(&instance.data)
        .bind(instance.retries)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ProcessError::NotFound(instance.process_id));
        }
        Ok(())
    }

    pub async fn find(&self, process_id: Uuid) -> Result<Option<ProcessInstance>, ProcessError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM process_instance WHERE process_id = $1"
        ))
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(Self::map_instance)
            .transpose()
            .map_err(Into::into)
    }

    /// Load and row-lock an instance inside the caller's transaction, so
    /// concurrent replies for one process serialize.
    pub async fn find_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        process_id: Uuid,
    ) -> Result<Option<ProcessInstance>, ProcessError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM process_instance WHERE process_id = $1 FOR UPDATE"
        ))
        .bind(process_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.as_ref()
            .map(Self::map_instance)
            .transpose()
            .map_err(Into::into)
    }

    /// Id of the live instance for `(process_type, business_key)`, if any.
    pub async fn find_live_by_key(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        process_type: &str,
        business_key: &str,
    ) -> Result<Option<Uuid>, ProcessError> {
        let row = sqlx::query(
            r#"
            SELECT process_id FROM process_instance
            WHERE process_type = $1 AND business_key = $2
              AND status IN ('NEW', 'RUNNING', 'COMPENSATING', 'PAUSED')
            "#,
        )
        .bind(process_type)
        .bind(business_key)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|r| r.try_get("process_id")).transpose()?)
    }

    /// Append one event; `seq` is identity-assigned and strictly increasing
    /// per process.
    pub async fn append_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        process_id: Uuid,
        event: &ProcessEvent,
    ) -> Result<i64, ProcessError> {
        let event_json = serde_json::to_value(event)?;

        let row = sqlx::query(
            r#"
            INSERT INTO process_log (process_id, at, event)
            VALUES ($1, NOW(), $2)
            RETURNING seq
            "#,
        )
        .bind(process_id)
        .bind(event_json)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.try_get("seq")?)
    }

    pub async fn load_log(&self, process_id: Uuid) -> Result<Vec<ProcessLogEntry>, ProcessError> {
        let rows = sqlx::query(
            "SELECT seq, at, event FROM process_log WHERE process_id = $1 ORDER BY seq",
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_log_entry).collect()
    }

    pub async fn load_log_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        process_id: Uuid,
    ) -> Result<Vec<ProcessLogEntry>, ProcessError> {
        let rows = sqlx::query(
            "SELECT seq, at, event FROM process_log WHERE process_id = $1 ORDER BY seq",
        )
        .bind(process_id)
        .fetch_all(&mut **tx)
        .await?;

        rows.iter().map(Self::map_log_entry).collect()
    }
}
