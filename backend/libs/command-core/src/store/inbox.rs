//! Consumer-side deduplication gate.
//!
//! One operation matters: `mark_if_absent` inserts `(message_id, handler)`
//! and reports whether this is the first observation. The unique primary
//! key plus insert-ignore semantics make the check atomic against
//! concurrent deliveries of the same message.

use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::StoreError;

pub struct InboxStore {
    pool: PgPool,
}

impl InboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record `(message_id, handler)` if unseen. Returns `true` on first
    /// observation, `false` when the pair was already recorded.
    ///
    /// Runs inside the caller's transaction: the executor rolls this entry
    /// back together with a retryable handler failure, so the inbox only
    /// ever records successful or permanently-failed processings.
    pub async fn mark_if_absent(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message_id: &str,
        handler: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox (message_id, handler, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (message_id, handler) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(handler)
        .execute(&mut **tx)
        .await?;

        let first = result.rows_affected() > 0;
        if !first {
            debug!(message_id = %message_id, handler = %handler, "Duplicate delivery detected");
        }
        Ok(first)
    }

    /// Delete entries older than `retention` to bound growth. Run this from
    /// a periodic maintenance task.
    pub async fn cleanup_older_than(&self, retention: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM inbox
            WHERE processed_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "Cleaned up old inbox entries");
        }
        Ok(deleted)
    }
}
