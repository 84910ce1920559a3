//! Error types for the command pipeline.

use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy surfaced by domain handlers.
///
/// Only `Permanent` parks the command in the DLQ and commits the failure;
/// the retryable kinds roll the executor transaction back so the broker
/// redelivers.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Non-retryable business error
    #[error("{0}")]
    Permanent(String),

    /// Domain error worth retrying (stale read, optimistic lock conflict)
    #[error("{0}")]
    RetryableBusiness(String),

    /// Infrastructure error (timeouts, connectivity)
    #[error("{0}")]
    Transient(String),
}

/// Errors raised by the command, inbox, and DLQ stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// `idempotency_key` already exists
    #[error("duplicate idempotency key")]
    DuplicateIdempotencyKey,

    /// `(name, business_key)` already exists
    #[error("duplicate business key for command name")]
    DuplicateBusinessKey,

    /// No command row for the given id
    #[error("command not found: {0}")]
    CommandNotFound(Uuid),

    /// The command is not in a state the requested transition allows
    #[error("command {0} not in a runnable state")]
    NotRunnable(Uuid),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors returned by the command bus to submitters.
#[derive(Error, Debug)]
pub enum BusError {
    /// Idempotency or business key conflict; surfaced to callers as a
    /// conflict, never retried
    #[error("duplicate command submission")]
    Duplicate,

    /// The bus could not persist the submission
    #[error("command bus unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

/// Errors raised while registering handlers.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Two distinct implementations registered for one command name
    #[error("ambiguous handler registration for '{0}'")]
    AmbiguousHandler(String),
}

/// Failure taxonomy inside the executor's transactional envelope.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Envelope is missing required identity fields
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// No handler registered for the command name
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Non-retryable business failure
    #[error("{0}")]
    Permanent(String),

    /// Domain failure worth retrying via redelivery
    #[error("{0}")]
    RetryableBusiness(String),

    /// Infrastructure failure worth retrying via redelivery
    #[error("{0}")]
    Transient(String),

    /// A process-initiating command could not start its process
    #[error("process start failed: {0}")]
    ProcessStartFailed(String),

    /// Database operation failed; retryable
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ExecutionError {
    /// Permanent errors commit the failure (FAILED command, DLQ entry,
    /// failure reply); everything else rolls back and rethrows.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ExecutionError::InvalidEnvelope(_)
                | ExecutionError::UnknownCommand(_)
                | ExecutionError::Permanent(_)
                | ExecutionError::ProcessStartFailed(_)
        )
    }

    /// Stable class name recorded in the DLQ.
    pub fn class(&self) -> &'static str {
        match self {
            ExecutionError::InvalidEnvelope(_) => "InvalidEnvelope",
            ExecutionError::UnknownCommand(_) => "UnknownCommand",
            ExecutionError::Permanent(_) => "Permanent",
            ExecutionError::RetryableBusiness(_) => "RetryableBusiness",
            ExecutionError::Transient(_) => "Transient",
            ExecutionError::ProcessStartFailed(_) => "ProcessStartFailed",
            ExecutionError::Database(_) => "Database",
        }
    }
}

impl From<HandlerError> for ExecutionError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Permanent(msg) => ExecutionError::Permanent(msg),
            HandlerError::RetryableBusiness(msg) => ExecutionError::RetryableBusiness(msg),
            HandlerError::Transient(msg) => ExecutionError::Transient(msg),
        }
    }
}

impl From<StoreError> for ExecutionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => ExecutionError::Database(e),
            StoreError::CommandNotFound(id) => {
                ExecutionError::Permanent(format!("no command row for {id}"))
            }
            StoreError::NotRunnable(id) => {
                ExecutionError::Permanent(format!("command {id} not in a runnable state"))
            }
            other => ExecutionError::Permanent(other.to_string()),
        }
    }
}

impl From<transactional_outbox::OutboxError> for ExecutionError {
    fn from(err: transactional_outbox::OutboxError) -> Self {
        match err {
            transactional_outbox::OutboxError::DatabaseError(e) => ExecutionError::Database(e),
            other => ExecutionError::Transient(other.to_string()),
        }
    }
}
