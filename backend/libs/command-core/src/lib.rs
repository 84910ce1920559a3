//! # Command Core
//!
//! Exactly-once command processing for the payments platform. A submitter
//! calls the [`CommandBus`], which persists a PENDING command plus its
//! `CommandRequested` outbox row in one transaction; the outbox dispatcher
//! carries the command to its queue; a consumer maps the raw message to an
//! [`Envelope`] and hands it to the [`CommandExecutor`], which deduplicates
//! through the inbox, runs the registered handler (or starts a process for
//! initiation commands), and emits the reply and event rows, all inside a
//! single transaction.
//!
//! ## Guarantees
//!
//! - A command with a given `idempotency_key` is accepted at most once.
//! - For any `(message_id, handler)` pair the handler body runs at most
//!   once: the inbox insert is the gate, and it commits only together with
//!   a successful or permanently-failed processing.
//! - Exactly one SUCCEEDED or FAILED transition per command id.
//! - Every accepted command produces exactly one reply row and one event
//!   row in the outbox.
//!
//! ## Wiring
//!
//! ```rust,no_run
//! use command_core::{
//!     CommandBus, CommandExecutor, CommandStore, CoreConfig, DlqStore, HandlerRegistry,
//!     InboxStore,
//! };
//! use sqlx::PgPool;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use transactional_outbox::SqlxOutboxStore;
//!
//! async fn wire(pool: PgPool) -> CommandExecutor {
//!     let config = CoreConfig::from_env();
//!     let outbox = Arc::new(SqlxOutboxStore::new(pool.clone(), Duration::from_secs(10)));
//!     let registry = Arc::new(HandlerRegistry::new()); // register handlers first
//!
//!     CommandExecutor::new(
//!         pool.clone(),
//!         Arc::new(InboxStore::new(pool.clone())),
//!         Arc::new(CommandStore::new(pool.clone())),
//!         Arc::new(DlqStore::new(pool)),
//!         outbox,
//!         registry,
//!         config,
//!     )
//! }
//! ```

pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod registry;
pub mod reply;
pub mod store;

pub use bus::CommandBus;
pub use config::CoreConfig;
pub use envelope::{Envelope, MessageKind};
pub use error::{BusError, ExecutionError, HandlerError, RegistryError, StoreError};
pub use executor::{CommandExecutor, ProcessInitiator, EXECUTOR_HANDLER};
pub use registry::{CommandHandler, CommandMessage, HandlerRegistry};
pub use reply::{CommandReply, ReplyStatus};
pub use store::{Command, CommandStatus, CommandStore, DlqEntry, DlqStore, InboxStore};
