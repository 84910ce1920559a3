//! Authoritative command lifecycle store.
//!
//! Status transitions are monotonic (PENDING -> RUNNING -> terminal) with
//! one exception: an expired lease returns a RUNNING command to PENDING so
//! redelivery can take over. Mutual exclusion comes entirely from the
//! unique keys and the guarded UPDATE statements; there are no
//! application-level locks.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;

/// Lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Running => "RUNNING",
            CommandStatus::Succeeded => "SUCCEEDED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::TimedOut => "TIMED_OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(CommandStatus::Pending),
            "RUNNING" => Some(CommandStatus::Running),
            "SUCCEEDED" => Some(CommandStatus::Succeeded),
            "FAILED" => Some(CommandStatus::Failed),
            "TIMED_OUT" => Some(CommandStatus::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Succeeded | CommandStatus::Failed | CommandStatus::TimedOut
        )
    }
}

/// A persisted command.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: Uuid,
    pub name: String,
    pub business_key: String,
    pub payload: Value,
    pub idempotency_key: String,
    pub status: CommandStatus,
    pub retries: i32,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reply: Option<Value>,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct CommandStore {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = "id, name, business_key, payload, idempotency_key, status, retries, \
     processing_lease_until, last_error, reply, requested_at, updated_at";

impl CommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<Command, sqlx::Error> {
        let status_text: String = row.try_get("status")?;
        let status = CommandStatus::parse(&status_text).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown command status: {status_text}").into())
        })?;

        Ok(Command {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            business_key: row.try_get("business_key")?,
            payload: row.try_get("payload")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status,
            retries: row.try_get("retries")?,
            lease_until: row.try_get("processing_lease_until")?,
            last_error: row.try_get("last_error")?,
            reply: row.try_get("reply")?,
            requested_at: row.try_get("requested_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn map_insert_error(e: sqlx::Error) -> StoreError {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return match db.constraint() {
                    Some(c) if c.contains("idempotency") => StoreError::DuplicateIdempotencyKey,
                    _ => StoreError::DuplicateBusinessKey,
                };
            }
        }
        StoreError::Database(e)
    }

    /// Persist a PENDING command inside the submitter's transaction.
    pub async fn save_pending(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        name: &str,
        idempotency_key: &str,
        business_key: &str,
        payload: &Value,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO command
                (id, name, business_key, payload, idempotency_key, status, retries, requested_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(business_key)
        .bind(payload)
        .bind(idempotency_key)
        .execute(&mut **tx)
        .await
        .map_err(Self::map_insert_error)?;

        debug!(command_id = %id, command_name = %name, business_key = %business_key, "Command accepted");
        Ok(id)
    }

    pub async fn exists_by_idempotency_key(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM command WHERE idempotency_key = $1) AS exists",
        )
        .bind(key)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.try_get("exists")?)
    }

    /// PENDING -> RUNNING under a lease. Also succeeds on a RUNNING command
    /// whose lease has elapsed, so redelivery can take the work over.
    pub async fn mark_running(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        lease_until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE command
            SET status = 'RUNNING', processing_lease_until = $2, updated_at = NOW()
            WHERE id = $1
              AND (status = 'PENDING'
                   OR (status = 'RUNNING' AND processing_lease_until < NOW()))
            "#,
        )
        .bind(id)
        .bind(lease_until)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_in(tx, id).await? {
                Some(_) => Err(StoreError::NotRunnable(id)),
                None => Err(StoreError::CommandNotFound(id)),
            };
        }
        Ok(())
    }

    pub async fn mark_succeeded(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        reply: &Value,
    ) -> Result<(), StoreError> {
        self.finish(tx, id, "SUCCEEDED", Some(reply), None).await
    }

    pub async fn mark_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        error: &str,
    ) -> Result<(), StoreError> {
        self.finish(tx, id, "FAILED", None, Some(error)).await
    }

    pub async fn mark_timed_out(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.finish(tx, id, "TIMED_OUT", None, Some(reason)).await
    }

    async fn finish(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        status: &str,
        reply: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE command
            SET status = $2,
                reply = COALESCE($3, reply),
                last_error = COALESCE($4, last_error),
                processing_lease_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(reply)
        .bind(error)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotRunnable(id));
        }

        debug!(command_id = %id, status = %status, "Command finished");
        Ok(())
    }

    /// Increment the retry counter without touching the status.
    ///
    /// Runs on the pool, not the executor's transaction: the count must
    /// survive the rollback a retryable failure causes.
    pub async fn bump_retry(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE command
            SET retries = retries + 1, last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CommandNotFound(id));
        }

        warn!(command_id = %id, error = %error, "Command retry recorded");
        Ok(())
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<Command>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM command WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref()
            .map(Self::map_row)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn find_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<Command>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM command WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;

        row.as_ref()
            .map(Self::map_row)
            .transpose()
            .map_err(Into::into)
    }

    /// RUNNING -> PENDING for every command whose lease elapsed, bumping
    /// the retry counter. Driven from the maintenance cadence.
    pub async fn release_expired_leases(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE command
            SET status = 'PENDING',
                retries = retries + 1,
                processing_lease_until = NULL,
                updated_at = NOW()
            WHERE status = 'RUNNING' AND processing_lease_until < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!(released, "Released expired command leases");
        }
        Ok(released)
    }
}
