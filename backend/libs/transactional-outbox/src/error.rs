//! Error types for the transactional outbox library.

use thiserror::Error;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Row not found in outbox
    #[error("Outbox row not found: {0}")]
    RowNotFound(i64),

    /// Failed to publish a row to the message broker
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// A row that can never be published (unknown category, missing topic)
    #[error("Unpublishable row {id}: {reason}")]
    Unpublishable { id: i64, reason: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by broker publishers.
///
/// The dispatcher reschedules `Transient` failures with backoff; `Terminal`
/// failures are recorded on the row before the dispatcher gives up on the
/// claim, leaving the row to stuck recovery.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("transient publish failure: {0}")]
    Transient(String),

    #[error("terminal publish failure: {0}")]
    Terminal(String),
}
