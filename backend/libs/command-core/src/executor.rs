//! The transactional envelope around command execution.
//!
//! `process` runs the whole exactly-once protocol in a single database
//! transaction: inbox gate, RUNNING transition under a lease, handler (or
//! process start) invocation, then either the success rows, the committed
//! failure (FAILED + DLQ + failure reply), or a rollback that rethrows so
//! the broker redelivers. The inbox write shares the transaction with the
//! handler outcome: a retryable failure rolls the dedup entry back too, so
//! the inbox only records successful or permanently-failed processings.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::envelope::{headers, Envelope};
use crate::error::{ExecutionError, StoreError};
use crate::registry::{CommandMessage, HandlerRegistry};
use crate::store::{CommandStore, DlqStore, InboxStore};
use transactional_outbox::{NewOutboxRow, OutboxStore};

/// Inbox handler name the executor dedups under.
pub const EXECUTOR_HANDLER: &str = "CommandExecutor";

/// Starts a process instance for a process-initiating command.
///
/// Implemented by the process manager; runs inside the executor's
/// transaction so the new instance, its log, and the first step command
/// commit atomically with the initiating command's success.
#[async_trait]
pub trait ProcessInitiator: Send + Sync {
    /// Returns the initiation result, a small JSON of the shape
    /// `{"processId": ..., "processType": ..., "status": "STARTED"}`.
    async fn start(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        env: &Envelope,
    ) -> Result<Value, ExecutionError>;
}

pub struct CommandExecutor {
    pool: PgPool,
    inbox: Arc<InboxStore>,
    commands: Arc<CommandStore>,
    dlq: Arc<DlqStore>,
    outbox: Arc<dyn OutboxStore>,
    registry: Arc<HandlerRegistry>,
    initiator: Option<Arc<dyn ProcessInitiator>>,
    config: CoreConfig,
}

impl CommandExecutor {
    pub fn new(
        pool: PgPool,
        inbox: Arc<InboxStore>,
        commands: Arc<CommandStore>,
        dlq: Arc<DlqStore>,
        outbox: Arc<dyn OutboxStore>,
        registry: Arc<HandlerRegistry>,
        config: CoreConfig,
    ) -> Self {
        Self {
            pool,
            inbox,
            commands,
            dlq,
            outbox,
            registry,
            initiator: None,
            config,
        }
    }

    /// Wire the process manager in for initiation-command routing.
    pub fn with_initiator(mut self, initiator: Arc<dyn ProcessInitiator>) -> Self {
        self.initiator = Some(initiator);
        self
    }

    /// Execute one inbound command envelope.
    ///
    /// Returns `Ok` for successful, duplicate, and permanently-failed
    /// processings (all committed); returns `Err` for retryable failures
    /// after rolling back, so the broker redelivers.
    pub async fn process(&self, env: &Envelope) -> Result<(), ExecutionError> {
        let command_id = env.validate()?;

        let mut tx = self.pool.begin().await?;

        let first_delivery = self
            .inbox
            .mark_if_absent(&mut tx, &env.message_id.to_string(), EXECUTOR_HANDLER)
            .await?;
        if !first_delivery {
            tx.commit().await?;
            debug!(
                message_id = %env.message_id,
                command_id = %command_id,
                "Duplicate delivery suppressed"
            );
            return Ok(());
        }

        let lease_until = Utc::now()
            + chrono::Duration::from_std(self.config.command_lease)
                .unwrap_or_else(|_| chrono::Duration::zero());
        match self
            .commands
            .mark_running(&mut tx, command_id, lease_until)
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotRunnable(_)) => {
                // Settled by an earlier delivery under a different message
                // id; record this delivery and return.
                tx.commit().await?;
                debug!(command_id = %command_id, "Command already settled, delivery recorded");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let outcome = self.route(&mut tx, env).await;

        match outcome {
            Ok(result) => {
                self.commands
                    .mark_succeeded(&mut tx, command_id, &result)
                    .await?;
                self.outbox
                    .insert(&mut tx, &self.reply_row(env, "CommandCompleted", result.clone()))
                    .await?;
                self.outbox
                    .insert(&mut tx, &self.event_row(env, "CommandCompleted", result))
                    .await?;
                tx.commit().await?;

                info!(
                    command_id = %command_id,
                    command_name = %env.name,
                    "Command succeeded"
                );
                Ok(())
            }
            Err(err) if err.is_permanent() => {
                self.commit_failure(tx, env, command_id, err).await
            }
            Err(err) => {
                // Roll the transaction back: the inbox entry and the RUNNING
                // transition disappear, so redelivery runs the handler again.
                drop(tx);
                if let Err(bump_err) = self.commands.bump_retry(command_id, &err.to_string()).await
                {
                    error!(
                        command_id = %command_id,
                        error = ?bump_err,
                        "Failed to record command retry"
                    );
                }
                warn!(
                    command_id = %command_id,
                    command_name = %env.name,
                    error = %err,
                    "Command failed, awaiting redelivery"
                );
                Err(err)
            }
        }
    }

    async fn route(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        env: &Envelope,
    ) -> Result<Value, ExecutionError> {
        if self.registry.is_initiation(&env.name) {
            return match &self.initiator {
                Some(initiator) => initiator.start(tx, env).await,
                None => Err(ExecutionError::ProcessStartFailed(format!(
                    "no process initiator wired for '{}'",
                    env.name
                ))),
            };
        }

        let message = CommandMessage::from_envelope(env)?;
        let reply = self.registry.handle(message).await?;
        Ok(reply.result_json())
    }

    /// Commit a permanent failure: FAILED command, DLQ entry, failure reply
    /// and event, all in the same transaction. Does not rethrow.
    async fn commit_failure(
        &self,
        mut tx: Transaction<'_, Postgres>,
        env: &Envelope,
        command_id: Uuid,
        err: ExecutionError,
    ) -> Result<(), ExecutionError> {
        let message = err.to_string();

        match self.commands.mark_failed(&mut tx, command_id, &message).await {
            Ok(()) => {
                let attempts = self
                    .commands
                    .find_in(&mut tx, command_id)
                    .await?
                    .map(|c| c.retries)
                    .unwrap_or(0);

                self.dlq
                    .park(
                        &mut tx,
                        command_id,
                        &env.name,
                        env.business_key().unwrap_or_default(),
                        &env.payload,
                        "FAILED",
                        err.class(),
                        Some(&message),
                        attempts,
                        &self.config.worker_id,
                    )
                    .await?;

                let failure = json!({ "error": message });
                self.outbox
                    .insert(&mut tx, &self.reply_row(env, "CommandFailed", failure.clone()))
                    .await?;
                self.outbox
                    .insert(&mut tx, &self.event_row(env, "CommandFailed", failure))
                    .await?;
            }
            Err(StoreError::NotRunnable(_)) => {
                // Already terminal; record the delivery and move on.
                warn!(
                    command_id = %command_id,
                    "Command not in a failable state, recording delivery only"
                );
            }
            Err(other) => return Err(other.into()),
        }

        tx.commit().await?;

        warn!(
            command_id = %command_id,
            command_name = %env.name,
            error_class = err.class(),
            error = %message,
            "Command failed permanently"
        );
        Ok(())
    }

    fn reply_row(&self, env: &Envelope, message_type: &str, payload: Value) -> NewOutboxRow {
        let mut row = NewOutboxRow::mq_reply(
            &self.config.queues,
            env.reply_to(),
            &env.correlation_id,
            message_type,
            payload,
        );
        if let Value::Object(hdrs) = &mut row.headers {
            hdrs.insert(
                headers::MESSAGE_ID.to_string(),
                Value::String(Uuid::new_v4().to_string()),
            );
            hdrs.insert(headers::TYPE.to_string(), Value::String(message_type.to_string()));
            if let Some(command_id) = env.command_id {
                hdrs.insert(
                    headers::COMMAND_ID.to_string(),
                    Value::String(command_id.to_string()),
                );
            }
            hdrs.insert(
                headers::COMMAND_NAME.to_string(),
                Value::String(env.name.clone()),
            );
            if let Some(business_key) = env.business_key() {
                hdrs.insert(
                    headers::BUSINESS_KEY.to_string(),
                    Value::String(business_key.to_string()),
                );
            }
        }
        row
    }

    fn event_row(&self, env: &Envelope, message_type: &str, payload: Value) -> NewOutboxRow {
        let topic = self.config.topics.event_topic(&env.name);
        let mut row =
            NewOutboxRow::kafka_event(&topic, env.business_key(), message_type, payload);
        if let Value::Object(hdrs) = &mut row.headers {
            hdrs.insert(
                headers::MESSAGE_ID.to_string(),
                Value::String(Uuid::new_v4().to_string()),
            );
            hdrs.insert(
                headers::CORRELATION_ID.to_string(),
                Value::String(env.correlation_id.clone()),
            );
            if let Some(command_id) = env.command_id {
                hdrs.insert(
                    headers::COMMAND_ID.to_string(),
                    Value::String(command_id.to_string()),
                );
            }
            hdrs.insert(
                headers::COMMAND_NAME.to_string(),
                Value::String(env.name.clone()),
            );
        }
        row
    }
}
