//! The public command submission API.
//!
//! `accept` is the only entry point producers use: inside one transaction
//! it rejects duplicate idempotency keys, persists the PENDING command, and
//! queues the `CommandRequested` outbox row. The returned command id is the
//! caller's handle; the eventual outcome arrives as a reply keyed by the
//! correlation id.

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BusError, StoreError};
use crate::store::CommandStore;
use transactional_outbox::{FastPathNotifier, NewOutboxRow, OutboxStore, QueueNaming};

pub struct CommandBus {
    pool: PgPool,
    commands: Arc<CommandStore>,
    outbox: Arc<dyn OutboxStore>,
    naming: QueueNaming,
    fast_path: Option<FastPathNotifier>,
}

impl CommandBus {
    pub fn new(
        pool: PgPool,
        commands: Arc<CommandStore>,
        outbox: Arc<dyn OutboxStore>,
        naming: QueueNaming,
    ) -> Self {
        Self {
            pool,
            commands,
            outbox,
            naming,
            fast_path: None,
        }
    }

    /// Notify the fast path with freshly committed outbox ids. Strictly an
    /// optimization; the dispatcher sweeper never depends on it.
    pub fn with_fast_path(mut self, notifier: FastPathNotifier) -> Self {
        self.fast_path = Some(notifier);
        self
    }

    /// Submit a named command. Returns the new command id promptly; the
    /// outcome is observed later via the reply carrying this correlation.
    pub async fn accept(
        &self,
        name: &str,
        idempotency_key: &str,
        business_key: &str,
        payload: Value,
        reply_headers: &BTreeMap<String, String>,
    ) -> Result<Uuid, BusError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BusError::Unavailable(e.into()))?;

        let (command_id, outbox_id) = self
            .accept_in(&mut tx, name, idempotency_key, business_key, payload, reply_headers)
            .await?;

        tx.commit()
            .await
            .map_err(|e| BusError::Unavailable(e.into()))?;

        if let Some(fast_path) = &self.fast_path {
            fast_path.notify(outbox_id).await;
        }

        info!(
            command_id = %command_id,
            command_name = %name,
            business_key = %business_key,
            "Command submitted"
        );
        Ok(command_id)
    }

    /// Transactional variant for callers that own a transaction (the
    /// process manager emits step commands this way). The caller commits;
    /// no fast-path notification fires, the sweeper picks the row up.
    pub async fn accept_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        name: &str,
        idempotency_key: &str,
        business_key: &str,
        payload: Value,
        reply_headers: &BTreeMap<String, String>,
    ) -> Result<(Uuid, i64), BusError> {
        if self
            .commands
            .exists_by_idempotency_key(tx, idempotency_key)
            .await
            .map_err(map_store_error)?
        {
            debug!(idempotency_key = %idempotency_key, "Duplicate submission rejected");
            return Err(BusError::Duplicate);
        }

        let command_id = self
            .commands
            .save_pending(tx, name, idempotency_key, business_key, &payload)
            .await
            .map_err(map_store_error)?;

        let row = NewOutboxRow::command_requested(
            &self.naming,
            name,
            command_id,
            business_key,
            payload,
            reply_headers,
        );
        let outbox_id = self
            .outbox
            .insert(tx, &row)
            .await
            .map_err(|e| BusError::Unavailable(e.into()))?;

        Ok((command_id, outbox_id))
    }
}

fn map_store_error(err: StoreError) -> BusError {
    match err {
        StoreError::DuplicateIdempotencyKey | StoreError::DuplicateBusinessKey => {
            BusError::Duplicate
        }
        other => BusError::Unavailable(other.into()),
    }
}
