//! Persistence for the command pipeline: command lifecycle, inbox dedup
//! gate, and the dead-letter store.

pub mod command;
pub mod dlq;
pub mod inbox;

pub use command::{Command, CommandStatus, CommandStore};
pub use dlq::{DlqEntry, DlqStore};
pub use inbox::InboxStore;
