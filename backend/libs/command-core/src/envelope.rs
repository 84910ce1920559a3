//! The transport-neutral message envelope.
//!
//! An envelope carries a command, reply, or event across brokers. Inbound
//! messages arrive as a raw body plus a header map; [`Envelope::from_raw`]
//! is the mapper the broker consumers hand their input to. Outbound
//! envelopes are built with the typed constructors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::error::ExecutionError;

/// Reserved header names on the wire.
pub mod headers {
    pub use transactional_outbox::headers::{
        BUSINESS_KEY, COMMAND_ID, COMMAND_NAME, CORRELATION_ID, MESSAGE_ID, REPLY_TO,
    };
    pub const CAUSATION_ID: &str = "causationId";
    pub const OCCURRED_AT: &str = "occurredAt";
    pub const TYPE: &str = "type";
}

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Command,
    Reply,
    Event,
}

/// Immutable message envelope.
///
/// Identity is the `message_id`: two envelopes with the same id are the
/// same message, whatever else differs (redelivery may change broker
/// metadata but not identity).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub name: String,
    pub command_id: Option<Uuid>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Value,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.message_id == other.message_id
    }
}

impl Eq for Envelope {}

impl std::hash::Hash for Envelope {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.message_id.hash(state);
    }
}

impl Envelope {
    /// Outbound command envelope with fresh identity.
    pub fn command(
        name: impl Into<String>,
        command_id: Uuid,
        correlation_id: impl Into<String>,
        key: Option<String>,
        headers: BTreeMap<String, String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            kind: MessageKind::Command,
            name: name.into(),
            command_id: Some(command_id),
            correlation_id: correlation_id.into(),
            causation_id: None,
            occurred_at: Utc::now(),
            key,
            headers,
            payload,
        }
    }

    /// Outbound reply envelope correlated to the originating command.
    pub fn reply(
        name: impl Into<String>,
        command_id: Uuid,
        correlation_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            kind: MessageKind::Reply,
            name: name.into(),
            command_id: Some(command_id),
            correlation_id: correlation_id.into(),
            causation_id: Some(command_id.to_string()),
            occurred_at: Utc::now(),
            key: None,
            headers: BTreeMap::new(),
            payload,
        }
    }

    /// Outbound event envelope.
    pub fn event(
        name: impl Into<String>,
        correlation_id: impl Into<String>,
        key: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            kind: MessageKind::Event,
            name: name.into(),
            command_id: None,
            correlation_id: correlation_id.into(),
            causation_id: None,
            occurred_at: Utc::now(),
            key,
            headers: BTreeMap::new(),
            payload,
        }
    }

    /// Construct an envelope from a raw broker message.
    ///
    /// The body must be JSON. The kind is inferred from the headers: a
    /// `commandName` header marks a command, a `CommandCompleted` /
    /// `CommandFailed` type marks a reply, anything else is an event. The
    /// message id falls back to the `commandId` when a broker strips custom
    /// headers, so redeliveries of the same command keep one identity.
    pub fn from_raw(
        body: &[u8],
        raw_headers: HashMap<String, String>,
    ) -> Result<Envelope, ExecutionError> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| ExecutionError::InvalidEnvelope(format!("body is not valid JSON: {e}")))?;

        let get = |key: &str| raw_headers.get(key).filter(|v| !v.is_empty()).cloned();

        let command_id = get(headers::COMMAND_ID)
            .map(|v| {
                Uuid::parse_str(&v).map_err(|_| {
                    ExecutionError::InvalidEnvelope(format!("malformed commandId header: {v}"))
                })
            })
            .transpose()?;

        let command_name = get(headers::COMMAND_NAME);
        let message_type = get(headers::TYPE);

        let (kind, name) = match (&command_name, message_type.as_deref()) {
            (Some(name), _) => (MessageKind::Command, name.clone()),
            (None, Some(t @ ("CommandCompleted" | "CommandFailed"))) => {
                (MessageKind::Reply, t.to_string())
            }
            (None, Some(t)) => (MessageKind::Event, t.to_string()),
            (None, None) => (MessageKind::Event, String::new()),
        };

        let message_id = get(headers::MESSAGE_ID)
            .and_then(|v| Uuid::parse_str(&v).ok())
            .or(command_id)
            .unwrap_or_else(Uuid::new_v4);

        let occurred_at = get(headers::OCCURRED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut header_map = BTreeMap::new();
        for (k, v) in raw_headers {
            header_map.insert(k, v);
        }

        Ok(Envelope {
            message_id,
            kind,
            name,
            command_id,
            correlation_id: header_map
                .get(headers::CORRELATION_ID)
                .cloned()
                .unwrap_or_default(),
            causation_id: header_map.get(headers::CAUSATION_ID).cloned(),
            occurred_at,
            key: header_map.get(headers::BUSINESS_KEY).cloned(),
            headers: header_map,
            payload,
        })
    }

    /// Check the identity invariants and return the command id.
    ///
    /// An envelope missing `commandId`, `correlationId`, or a name never
    /// enters the executor.
    pub fn validate(&self) -> Result<Uuid, ExecutionError> {
        if self.name.is_empty() {
            return Err(ExecutionError::InvalidEnvelope("empty name".to_string()));
        }
        if self.correlation_id.is_empty() {
            return Err(ExecutionError::InvalidEnvelope(
                "missing correlationId".to_string(),
            ));
        }
        self.command_id
            .ok_or_else(|| ExecutionError::InvalidEnvelope("missing commandId".to_string()))
    }

    /// The requester's reply queue, when one was named.
    pub fn reply_to(&self) -> Option<&str> {
        self.headers
            .get(headers::REPLY_TO)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Business key from the headers, falling back to the partition key.
    pub fn business_key(&self) -> Option<&str> {
        self.headers
            .get(headers::BUSINESS_KEY)
            .map(String::as_str)
            .or(self.key.as_deref())
            .filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command_headers(command_id: Uuid) -> HashMap<String, String> {
        HashMap::from([
            ("commandId".to_string(), command_id.to_string()),
            ("commandName".to_string(), "CreateUser".to_string()),
            ("correlationId".to_string(), "corr-1".to_string()),
            ("businessKey".to_string(), "user-42".to_string()),
            ("replyTo".to_string(), "replies".to_string()),
        ])
    }

    #[test]
    fn test_from_raw_maps_command() {
        let command_id = Uuid::new_v4();
        let env = Envelope::from_raw(br#"{"username":"a"}"#, command_headers(command_id)).unwrap();

        assert_eq!(env.kind, MessageKind::Command);
        assert_eq!(env.name, "CreateUser");
        assert_eq!(env.command_id, Some(command_id));
        assert_eq!(env.correlation_id, "corr-1");
        assert_eq!(env.business_key(), Some("user-42"));
        assert_eq!(env.reply_to(), Some("replies"));
        assert_eq!(env.payload, json!({"username": "a"}));
        // no messageId header: identity falls back to the command id
        assert_eq!(env.message_id, command_id);
        assert!(env.validate().is_ok());
    }

    #[test]
    fn test_from_raw_maps_reply() {
        let headers = HashMap::from([
            ("type".to_string(), "CommandCompleted".to_string()),
            ("correlationId".to_string(), "proc-1".to_string()),
            ("commandId".to_string(), Uuid::new_v4().to_string()),
        ]);
        let env = Envelope::from_raw(br#"{"ok":true}"#, headers).unwrap();
        assert_eq!(env.kind, MessageKind::Reply);
        assert_eq!(env.name, "CommandCompleted");
    }

    #[test]
    fn test_validate_rejects_missing_command_id() {
        let mut headers = command_headers(Uuid::new_v4());
        headers.remove("commandId");
        let env = Envelope::from_raw(b"{}", headers).unwrap();
        assert!(matches!(
            env.validate(),
            Err(ExecutionError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_from_raw_rejects_non_json_body() {
        let result = Envelope::from_raw(b"not json", command_headers(Uuid::new_v4()));
        assert!(matches!(result, Err(ExecutionError::InvalidEnvelope(_))));
    }

    #[test]
    fn test_equality_is_by_message_id() {
        let a = Envelope::command("A", Uuid::new_v4(), "c", None, BTreeMap::new(), json!({}));
        let mut b = a.clone();
        b.name = "B".to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn test_json_round_trip_uses_camel_case() {
        let env = Envelope::command(
            "CreateUser",
            Uuid::new_v4(),
            "corr-1",
            Some("user-42".to_string()),
            BTreeMap::new(),
            json!({"username": "a"}),
        );
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"messageId\""));
        assert!(text.contains("\"commandId\""));
        assert!(text.contains("\"occurredAt\""));
        assert!(text.contains("\"type\":\"command\""));

        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.name, env.name);
    }
}
