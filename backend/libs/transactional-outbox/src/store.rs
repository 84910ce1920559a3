//! Postgres-backed outbox store.
//!
//! All claiming is race-free under concurrent dispatchers: the claim
//! statements lock candidate rows with `FOR UPDATE SKIP LOCKED`, so two
//! sweepers never hand out the same row.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{OutboxError, OutboxResult};
use crate::{NewOutboxRow, OutboxRow};

/// Store operations over the `outbox` table.
///
/// `insert` MUST be called within the producer's transaction so the queued
/// message commits or rolls back together with the business writes. The
/// remaining operations run in their own short transactions; no database
/// connection is ever held across a broker publish.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a NEW row; returns the server-assigned monotonic id.
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: &NewOutboxRow,
    ) -> OutboxResult<i64>;

    /// Claim up to `max` due rows for `claimer`.
    ///
    /// Picks NEW rows whose `next_at` has passed (or is unset) plus CLAIMED
    /// rows abandoned longer than the claim timeout, in
    /// `(COALESCE(next_at, epoch), created_at)` order.
    async fn claim(&self, max: i64, claimer: &str) -> OutboxResult<Vec<OutboxRow>>;

    /// Claim one specific NEW row (fast path). Returns `None` when the row
    /// is not claimable (already taken, not NEW, or deferred).
    async fn claim_one(&self, id: i64, claimer: &str) -> OutboxResult<Option<OutboxRow>>;

    /// CLAIMED -> PUBLISHED; records the successful attempt.
    async fn mark_published(&self, id: i64) -> OutboxResult<()>;

    /// CLAIMED -> NEW with `next_at = now + backoff` and one more attempt.
    async fn reschedule(&self, id: i64, backoff: Duration, error: &str) -> OutboxResult<()>;

    /// Record a terminal transport error and a `next_at` throttle without
    /// changing status. The row stays CLAIMED until stuck recovery returns
    /// it to the queue.
    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_at: DateTime<Utc>,
    ) -> OutboxResult<()>;

    /// Park a row that can never be published (unknown category, missing
    /// topic). Terminal.
    async fn park_failed(&self, id: i64, error: &str) -> OutboxResult<()>;

    /// Return all CLAIMED rows older than `older_than` to NEW, clearing the
    /// claim fields. Returns the number of recovered rows.
    async fn recover_stuck(&self, older_than: Duration) -> OutboxResult<u64>;

    /// Pending count and oldest pending age in seconds (0 when none).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx-based implementation of [`OutboxStore`] using PostgreSQL.
pub struct SqlxOutboxStore {
    pool: PgPool,
    claim_timeout: Duration,
}

const SELECT_COLUMNS: &str = "id, category, topic, key, type, payload, headers, status, \
     attempts, next_at, claimed_at, claimed_by, created_at, published_at, last_error";

impl SqlxOutboxStore {
    pub fn new(pool: PgPool, claim_timeout: Duration) -> Self {
        Self {
            pool,
            claim_timeout,
        }
    }

    fn map_row(row: &PgRow) -> Result<OutboxRow, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            category: row.try_get("category")?,
            topic: row.try_get("topic")?,
            key: row.try_get("key")?,
            message_type: row.try_get("type")?,
            payload: row.try_get("payload")?,
            headers: row.try_get("headers")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            next_at: row.try_get("next_at")?,
            claimed_at: row.try_get("claimed_at")?,
            claimed_by: row.try_get("claimed_by")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            last_error: row.try_get("last_error")?,
        })
    }

    /// Fetch one row by id, regardless of status.
    pub async fn find(&self, id: i64) -> OutboxResult<Option<OutboxRow>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM outbox WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch outbox row")?;

        row.as_ref().map(Self::map_row).transpose().map_err(Into::into)
    }

    /// Reset rows created since `ts` to NEW for operational replay.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'NEW',
                attempts = 0,
                next_at = NULL,
                claimed_at = NULL,
                claimed_by = NULL,
                published_at = NULL,
                last_error = NULL
            WHERE created_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("Failed to replay rows since timestamp")?;

        Ok(res.rows_affected())
    }

    /// Reset rows in an inclusive id range to NEW for operational backfill.
    pub async fn replay_range(&self, from_id: i64, to_id: i64) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'NEW',
                attempts = 0,
                next_at = NULL,
                claimed_at = NULL,
                claimed_by = NULL,
                published_at = NULL,
                last_error = NULL
            WHERE id BETWEEN $1 AND $2
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .execute(&self.pool)
        .await
        .context("Failed to replay rows by id range")?;

        Ok(res.rows_affected())
    }
}

#[async_trait]
impl OutboxStore for SqlxOutboxStore {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: &NewOutboxRow,
    ) -> OutboxResult<i64> {
        let rec = sqlx::query(
            r#"
            INSERT INTO outbox (category, topic, key, type, payload, headers, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'NEW', 0, NOW())
            RETURNING id
            "#,
        )
        .bind(row.category.as_str())
        .bind(&row.topic)
        .bind(&row.key)
        .bind(&row.message_type)
        .bind(&row.payload)
        .bind(&row.headers)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert outbox row")?;

        let id: i64 = rec.try_get("id")?;

        debug!(
            outbox_id = id,
            category = row.category.as_str(),
            message_type = %row.message_type,
            topic = ?row.topic,
            "Outbox row queued"
        );

        Ok(id)
    }

    async fn claim(&self, max: i64, claimer: &str) -> OutboxResult<Vec<OutboxRow>> {
        let sql = format!(
            r#"
            WITH due AS (
                SELECT id
                FROM outbox
                WHERE (status = 'NEW' AND (next_at IS NULL OR next_at <= NOW()))
                   OR (status = 'CLAIMED' AND claimed_at < NOW() - make_interval(secs => $3))
                ORDER BY COALESCE(next_at, 'epoch'::timestamptz), created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox AS o
            SET status = 'CLAIMED', claimed_at = NOW(), claimed_by = $2
            FROM due
            WHERE o.id = due.id
            RETURNING {SELECT_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(max)
            .bind(claimer)
            .bind(self.claim_timeout.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .context("Failed to claim outbox batch")?;

        let mut claimed: Vec<OutboxRow> = rows
            .iter()
            .map(Self::map_row)
            .collect::<Result<_, sqlx::Error>>()?;

        // RETURNING order is unspecified; restore queue order for the caller.
        claimed.sort_by_key(|r| (r.next_at.unwrap_or(DateTime::UNIX_EPOCH), r.created_at));

        if !claimed.is_empty() {
            debug!(count = claimed.len(), claimer = %claimer, "Claimed outbox batch");
        }

        Ok(claimed)
    }

    async fn claim_one(&self, id: i64, claimer: &str) -> OutboxResult<Option<OutboxRow>> {
        let sql = format!(
            r#"
            UPDATE outbox
            SET status = 'CLAIMED', claimed_at = NOW(), claimed_by = $2
            WHERE id = $1
              AND status = 'NEW'
              AND (next_at IS NULL OR next_at <= NOW())
            RETURNING {SELECT_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(claimer)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to claim outbox row")?;

        row.as_ref().map(Self::map_row).transpose().map_err(Into::into)
    }

    async fn mark_published(&self, id: i64) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PUBLISHED', published_at = NOW(), attempts = attempts + 1
            WHERE id = $1 AND status = 'CLAIMED'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark outbox row as published")?;

        if result.rows_affected() == 0 {
            warn!(outbox_id = id, "Row not CLAIMED when marking as published");
            return Err(OutboxError::RowNotFound(id));
        }

        debug!(outbox_id = id, "Outbox row published");
        Ok(())
    }

    async fn reschedule(&self, id: i64, backoff: Duration, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'NEW',
                attempts = attempts + 1,
                next_at = NOW() + make_interval(secs => $2),
                claimed_at = NULL,
                claimed_by = NULL,
                last_error = $3
            WHERE id = $1 AND status = 'CLAIMED'
            "#,
        )
        .bind(id)
        .bind(backoff.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to reschedule outbox row")?;

        if result.rows_affected() == 0 {
            warn!(outbox_id = id, "Row not CLAIMED when rescheduling");
            return Err(OutboxError::RowNotFound(id));
        }

        warn!(
            outbox_id = id,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Outbox row rescheduled"
        );
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET next_at = $2, last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to record outbox failure")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::RowNotFound(id));
        }

        warn!(outbox_id = id, error = %error, "Outbox publish failure recorded");
        Ok(())
    }

    async fn park_failed(&self, id: i64, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'FAILED', last_error = $2
            WHERE id = $1 AND status <> 'PUBLISHED'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to park outbox row")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::RowNotFound(id));
        }

        warn!(outbox_id = id, error = %error, "Outbox row parked as FAILED");
        Ok(())
    }

    async fn recover_stuck(&self, older_than: Duration) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'NEW', claimed_at = NULL, claimed_by = NULL
            WHERE status = 'CLAIMED'
              AND claimed_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("Failed to recover stuck outbox rows")?;

        Ok(result.rows_affected())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox
            WHERE status IN ('NEW', 'CLAIMED')
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}
