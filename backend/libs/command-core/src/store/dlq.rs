//! Dead-letter store for permanently failed commands. Append-only.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;

/// A parked command.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub id: Uuid,
    pub command_id: Uuid,
    pub command_name: String,
    pub business_key: String,
    pub payload: Value,
    pub failed_status: String,
    pub error_class: String,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub parked_by: String,
    pub parked_at: DateTime<Utc>,
}

pub struct DlqStore {
    pool: PgPool,
}

impl DlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<DlqEntry, sqlx::Error> {
        Ok(DlqEntry {
            id: row.try_get("id")?,
            command_id: row.try_get("command_id")?,
            command_name: row.try_get("command_name")?,
            business_key: row.try_get("business_key")?,
            payload: row.try_get("payload")?,
            failed_status: row.try_get("failed_status")?,
            error_class: row.try_get("error_class")?,
            error_message: row.try_get("error_message")?,
            attempts: row.try_get("attempts")?,
            parked_by: row.try_get("parked_by")?,
            parked_at: row.try_get("parked_at")?,
        })
    }

    /// Park a command inside the executor's transaction, so the DLQ entry
    /// commits together with the FAILED transition.
    #[allow(clippy::too_many_arguments)]
    pub async fn park(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        command_id: Uuid,
        command_name: &str,
        business_key: &str,
        payload: &Value,
        failed_status: &str,
        error_class: &str,
        error_message: Option<&str>,
        attempts: i32,
        parked_by: &str,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO command_dlq
                (id, command_id, command_name, business_key, payload, failed_status,
                 error_class, error_message, attempts, parked_by, parked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            "#,
        )
        .bind(id)
        .bind(command_id)
        .bind(command_name)
        .bind(business_key)
        .bind(payload)
        .bind(failed_status)
        .bind(error_class)
        .bind(error_message)
        .bind(attempts)
        .bind(parked_by)
        .execute(&mut **tx)
        .await?;

        warn!(
            command_id = %command_id,
            command_name = %command_name,
            error_class = %error_class,
            "Command parked in DLQ"
        );
        Ok(id)
    }

    /// Most recently parked commands, for operator inspection.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<DlqEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, command_id, command_name, business_key, payload, failed_status,
                   error_class, error_message, attempts, parked_by, parked_at
            FROM command_dlq
            ORDER BY parked_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(Self::map_row)
            .collect::<Result<_, sqlx::Error>>()
            .map_err(Into::into)
    }
}
