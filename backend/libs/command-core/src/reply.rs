//! Command replies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Outcome of a command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
}

/// The reply a handler invocation produces.
///
/// Handlers return raw JSON; the registry wraps it here. A unit (`null`)
/// return becomes an empty data map with `Succeeded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    pub command_id: Uuid,
    pub correlation_id: String,
    pub status: ReplyStatus,
    pub data: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    pub fn succeeded(command_id: Uuid, correlation_id: impl Into<String>, result: Value) -> Self {
        let data = match result {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        Self {
            command_id,
            correlation_id: correlation_id.into(),
            status: ReplyStatus::Succeeded,
            data,
            error: None,
        }
    }

    pub fn failed(
        command_id: Uuid,
        correlation_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            correlation_id: correlation_id.into(),
            status: ReplyStatus::Failed,
            data: Map::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Succeeded
    }

    /// The result JSON published on the reply queue and the event topic.
    pub fn result_json(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_result_becomes_empty_data() {
        let reply = CommandReply::succeeded(Uuid::new_v4(), "c", Value::Null);
        assert!(reply.is_success());
        assert!(reply.data.is_empty());
        assert_eq!(reply.result_json(), json!({}));
    }

    #[test]
    fn test_scalar_result_is_wrapped() {
        let reply = CommandReply::succeeded(Uuid::new_v4(), "c", json!(42));
        assert_eq!(reply.result_json(), json!({"result": 42}));
    }

    #[test]
    fn test_serialized_form() {
        let id = Uuid::new_v4();
        let reply = CommandReply::failed(id, "corr", "bad input");
        let text = serde_json::to_string(&reply).unwrap();
        assert!(text.contains("\"status\":\"FAILED\""));
        assert!(text.contains("\"commandId\""));
        assert!(text.contains("\"error\":\"bad input\""));
    }
}
