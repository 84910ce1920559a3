//! # Process Manager
//!
//! Durable multi-step process orchestration (saga) with compensation. A
//! process is a graph of steps, each a command type with an optional
//! compensation command type; the manager interprets the graph over a
//! persisted instance and an append-only event log, advancing on the
//! command replies that carry the process id as their correlation.
//!
//! On a permanent step failure the manager walks the log in reverse and
//! emits the compensation command for every completed step that has one;
//! the instance ends `COMPENSATED` when they all succeed, `FAILED` when a
//! compensation itself fails permanently or nothing was compensatable.
//!
//! The log's `seq` order defines the truth of what happened: replaying it
//! with [`rebuild_from_log`] yields the same state as the stored instance.
//!
//! ```rust
//! use process_manager::ProcessDefinition;
//!
//! let payment = ProcessDefinition::builder("SimplePayment", "SubmitPayment")
//!     .predicate("requiresFx", |data| {
//!         data.get("requiresFx").and_then(|v| v.as_bool()).unwrap_or(false)
//!     })
//!     .start_with("BookLimits").with_compensation("ReverseLimits")
//!     .then_if("requiresFx").when_true("BookFx").with_compensation("UnwindFx")
//!     .then("CreateTransaction").with_compensation("ReverseTransaction")
//!     .then("CreatePayment")
//!     .end()
//!     .unwrap();
//! # let _ = payment;
//! ```

pub mod error;
pub mod graph;
pub mod manager;
pub mod model;
pub mod store;

pub use error::ProcessError;
pub use graph::{ProcessDefinition, ProcessDefinitionBuilder, StepRecord};
pub use manager::{ProcessConfig, ProcessManager};
pub use model::{
    rebuild_from_log, ProcessEvent, ProcessInstance, ProcessLogEntry, ProcessStatus,
};
pub use store::ProcessStore;
