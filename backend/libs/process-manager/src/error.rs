//! Error types for process orchestration.

use thiserror::Error;
use uuid::Uuid;

use command_core::{BusError, StoreError};

#[derive(Error, Debug)]
pub enum ProcessError {
    /// No definition registered for the process type
    #[error("unknown process type: {0}")]
    UnknownProcessType(String),

    /// A step references a predicate the definition never registered
    #[error("unknown predicate: {0}")]
    UnknownPredicate(String),

    /// The instance's current step is not in the definition
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// A definition was built without steps
    #[error("process definition '{0}' has no steps")]
    EmptyProcess(String),

    /// A live instance already exists for this `(process_type, business_key)`
    #[error("process '{process_type}' already running for business key '{business_key}'")]
    AlreadyRunning {
        process_type: String,
        business_key: String,
    },

    /// No instance with the given id
    #[error("process not found: {0}")]
    NotFound(Uuid),

    /// The instance is not in a state the requested operation allows
    #[error("process {process_id} in state {status} cannot {operation}")]
    InvalidState {
        process_id: Uuid,
        status: String,
        operation: &'static str,
    },

    /// Emitting a step command failed
    #[error("command bus error: {0}")]
    Bus(#[from] BusError),

    /// Command store error during maintenance
    #[error("command store error: {0}")]
    Store(#[from] StoreError),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Log event (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
