//! Command name to handler routing.
//!
//! Handlers are values, not classes: anything implementing
//! [`CommandHandler`] can be registered under a command name. Registration
//! is explicit; there is no scanning. The registry also tracks which
//! command names initiate a process, declared by the process definitions
//! the embedding service registers.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{ExecutionError, HandlerError, RegistryError};
use crate::reply::CommandReply;

/// What a handler sees: the command identity plus its deserialized payload.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    pub command_id: Uuid,
    pub name: String,
    pub business_key: Option<String>,
    pub correlation_id: String,
    pub payload: Value,
}

impl CommandMessage {
    pub fn from_envelope(env: &Envelope) -> Result<Self, ExecutionError> {
        let command_id = env.validate()?;
        Ok(Self {
            command_id,
            name: env.name.clone(),
            business_key: env.business_key().map(str::to_string),
            correlation_id: env.correlation_id.clone(),
            payload: env.payload.clone(),
        })
    }
}

/// A domain command handler.
///
/// The returned JSON becomes the command's result; `Value::Null` is a valid
/// "void" return and produces an empty reply data map.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: CommandMessage) -> Result<Value, HandlerError>;
}

/// Mapping from command name to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    initiations: HashSet<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a command name.
    ///
    /// Registering the same underlying instance twice (a wrapper and its
    /// target, say) collapses silently; a *different* implementation for an
    /// already-taken name is ambiguous and rejected.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        match self.handlers.get(&name) {
            Some(existing) if Arc::ptr_eq(existing, &handler) => Ok(()),
            Some(_) => Err(RegistryError::AmbiguousHandler(name)),
            None => {
                debug!(command_name = %name, "Handler registered");
                self.handlers.insert(name, handler);
                Ok(())
            }
        }
    }

    /// Declare a command name as process-initiating. The executor routes
    /// these to the process manager instead of a handler.
    pub fn register_initiation(&mut self, name: impl Into<String>) {
        let name = name.into();
        debug!(command_name = %name, "Process initiation command declared");
        self.initiations.insert(name);
    }

    pub fn is_initiation(&self, name: &str) -> bool {
        self.initiations.contains(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name) || self.initiations.contains(name)
    }

    /// Route a command to its handler and wrap the outcome.
    pub async fn handle(&self, command: CommandMessage) -> Result<CommandReply, ExecutionError> {
        let handler = self
            .handlers
            .get(&command.name)
            .ok_or_else(|| ExecutionError::UnknownCommand(command.name.clone()))?;

        let command_id = command.command_id;
        let correlation_id = command.correlation_id.clone();

        let result = handler.handle(command).await.map_err(ExecutionError::from)?;
        Ok(CommandReply::succeeded(command_id, correlation_id, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, command: CommandMessage) -> Result<Value, HandlerError> {
            Ok(command.payload)
        }
    }

    struct UnitHandler;

    #[async_trait]
    impl CommandHandler for UnitHandler {
        async fn handle(&self, _command: CommandMessage) -> Result<Value, HandlerError> {
            Ok(Value::Null)
        }
    }

    fn message(name: &str, payload: Value) -> CommandMessage {
        CommandMessage {
            command_id: Uuid::new_v4(),
            name: name.to_string(),
            business_key: Some("bk".to_string()),
            correlation_id: "corr".to_string(),
            payload,
        }
    }

    #[test]
    fn test_same_instance_registered_twice_collapses() {
        let mut registry = HandlerRegistry::new();
        let handler: Arc<dyn CommandHandler> = Arc::new(EchoHandler);

        registry.register("Echo", Arc::clone(&handler)).unwrap();
        registry.register("Echo", handler).unwrap();
        assert!(registry.is_registered("Echo"));
    }

    #[test]
    fn test_distinct_handlers_for_one_name_are_ambiguous() {
        let mut registry = HandlerRegistry::new();
        registry.register("Echo", Arc::new(EchoHandler)).unwrap();

        let err = registry.register("Echo", Arc::new(EchoHandler)).unwrap_err();
        assert!(matches!(err, RegistryError::AmbiguousHandler(name) if name == "Echo"));
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let registry = HandlerRegistry::new();
        let err = registry.handle(message("Nope", json!({}))).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownCommand(_)));
    }

    #[tokio::test]
    async fn test_unit_return_becomes_empty_succeeded_reply() {
        let mut registry = HandlerRegistry::new();
        registry.register("Noop", Arc::new(UnitHandler)).unwrap();

        let reply = registry.handle(message("Noop", json!({}))).await.unwrap();
        assert!(reply.is_success());
        assert!(reply.data.is_empty());
    }

    #[tokio::test]
    async fn test_handler_result_flows_into_reply_data() {
        let mut registry = HandlerRegistry::new();
        registry.register("Echo", Arc::new(EchoHandler)).unwrap();

        let reply = registry
            .handle(message("Echo", json!({"userId": "u-1"})))
            .await
            .unwrap();
        assert_eq!(reply.result_json(), json!({"userId": "u-1"}));
    }

    #[test]
    fn test_initiation_tracking() {
        let mut registry = HandlerRegistry::new();
        registry.register_initiation("StartPayment");
        assert!(registry.is_initiation("StartPayment"));
        assert!(!registry.is_initiation("CreateUser"));
    }
}
