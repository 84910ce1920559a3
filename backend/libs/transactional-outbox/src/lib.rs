//! # Transactional Outbox
//!
//! Durable bridge between the command database and the message brokers. A
//! producer inserts outbound messages into the `outbox` table inside the same
//! transaction as its business writes; a background dispatcher claims queued
//! rows, publishes them to IBM MQ (commands, replies) or Kafka (events), and
//! retries failed publishes with clamped exponential backoff.
//!
//! This guarantees **at-least-once delivery** with idempotent consumers even
//! if:
//! - The service crashes after database commit but before broker publish
//! - A broker is temporarily unavailable
//! - A dispatcher dies while holding claimed rows (stuck recovery reclaims)
//!
//! ## Row lifecycle
//!
//! ```text
//! NEW --claim--> CLAIMED --publish ok--> PUBLISHED
//!  ^               |
//!  |               +--publish error--> NEW (next_at = now + backoff)
//!  |               +--unpublishable--> FAILED
//!  +--recover_stuck (claimed_at older than claim timeout)
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use transactional_outbox::{NewOutboxRow, OutboxStore, QueueNaming, SqlxOutboxStore};
//! use sqlx::PgPool;
//! use std::collections::BTreeMap;
//! use uuid::Uuid;
//!
//! async fn submit(pool: &PgPool, outbox: &SqlxOutboxStore) -> Result<(), Box<dyn std::error::Error>> {
//!     let naming = QueueNaming::default();
//!     let mut tx = pool.begin().await?;
//!
//!     // Business writes go here, then the outbox row in the same transaction.
//!     let row = NewOutboxRow::command_requested(
//!         &naming,
//!         "CreateUser",
//!         Uuid::new_v4(),
//!         "user-42",
//!         serde_json::json!({"username": "a"}),
//!         &BTreeMap::new(),
//!     );
//!     let id = outbox.insert(&mut tx, &row).await?;
//!
//!     tx.commit().await?;
//!     let _ = id; // hand to the fast path if one is configured
//!     Ok(())
//! }
//! ```
//!
//! The dispatcher (see [`dispatcher::OutboxDispatcher`]) runs on its own
//! periodic task and is sufficient on its own; the Redis fast path
//! ([`fast_path`]) is strictly a latency optimization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

pub mod dispatcher;
pub mod fast_path;
pub mod metrics;
pub mod publisher;
mod error;
mod store;

pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
pub use error::{OutboxError, OutboxResult, PublishError};
pub use fast_path::{FastPathConfig, FastPathListener, FastPathNotifier};
pub use publisher::{KafkaEventPublisher, KafkaPublisher, MqPublisher};
pub use store::{OutboxStore, SqlxOutboxStore};

/// Reserved outbound header names.
pub mod headers {
    pub const MESSAGE_ID: &str = "messageId";
    pub const COMMAND_ID: &str = "commandId";
    pub const COMMAND_NAME: &str = "commandName";
    pub const BUSINESS_KEY: &str = "businessKey";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const REPLY_TO: &str = "replyTo";
}

/// Message category of an outbox row. Decides which broker the dispatcher
/// routes the row to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxCategory {
    Command,
    Reply,
    Event,
}

impl OutboxCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxCategory::Command => "command",
            OutboxCategory::Reply => "reply",
            OutboxCategory::Event => "event",
        }
    }
}

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    New,
    Claimed,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::New => "NEW",
            OutboxStatus::Claimed => "CLAIMED",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OutboxStatus::New),
            "CLAIMED" => Some(OutboxStatus::Claimed),
            "PUBLISHED" => Some(OutboxStatus::Published),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// A message queued for publication. Built by one of the factory
/// constructors and inserted inside the producer's transaction; the `id` is
/// assigned server-side on insert and is strictly monotonic.
#[derive(Debug, Clone)]
pub struct NewOutboxRow {
    pub category: OutboxCategory,
    pub topic: Option<String>,
    pub key: Option<String>,
    pub message_type: String,
    pub payload: Value,
    pub headers: Value,
}

/// A persisted outbox row as read back from the database.
///
/// `category` stays a raw string here: rows written by older producers may
/// carry categories this build does not know, and the dispatcher must treat
/// those as permanently unpublishable rather than fail row mapping.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub category: String,
    pub topic: Option<String>,
    pub key: Option<String>,
    pub message_type: String,
    pub payload: Value,
    pub headers: Value,
    pub status: String,
    pub attempts: i32,
    pub next_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Queue naming scheme for MQ-bound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueNaming {
    /// Prefix for per-command request queues
    pub command_prefix: String,
    /// Suffix appended after the command name
    pub queue_suffix: String,
    /// Default reply queue when the requester did not name one
    pub reply_queue: String,
}

impl Default for QueueNaming {
    fn default() -> Self {
        Self {
            command_prefix: "commands.".to_string(),
            queue_suffix: String::new(),
            reply_queue: "replies".to_string(),
        }
    }
}

impl QueueNaming {
    /// Load naming overrides from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            command_prefix: std::env::var("QUEUE_COMMAND_PREFIX")
                .unwrap_or(defaults.command_prefix),
            queue_suffix: std::env::var("QUEUE_SUFFIX").unwrap_or(defaults.queue_suffix),
            reply_queue: std::env::var("QUEUE_REPLY").unwrap_or(defaults.reply_queue),
        }
    }

    /// Request queue for a named command.
    pub fn command_queue(&self, command_name: &str) -> String {
        format!("{}{}{}", self.command_prefix, command_name, self.queue_suffix)
    }
}

/// Topic naming scheme for Kafka-bound events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicNaming {
    /// Prefix for derived event topics
    pub event_prefix: String,
}

impl Default for TopicNaming {
    fn default() -> Self {
        Self {
            event_prefix: "events.".to_string(),
        }
    }
}

impl TopicNaming {
    pub fn from_env() -> Self {
        Self {
            event_prefix: std::env::var("TOPIC_EVENT_PREFIX")
                .unwrap_or_else(|_| Self::default().event_prefix),
        }
    }

    /// Event topic derived from the originating command name.
    pub fn event_topic(&self, command_name: &str) -> String {
        format!("{}{}", self.event_prefix, command_name)
    }
}

impl NewOutboxRow {
    /// A `CommandRequested` message bound for the command's request queue.
    ///
    /// Merges the caller's reply headers with the reserved routing headers
    /// and stamps a fresh `messageId` so every delivery of this queued
    /// command carries the same identity.
    pub fn command_requested(
        naming: &QueueNaming,
        name: &str,
        command_id: Uuid,
        business_key: &str,
        payload: Value,
        reply_headers: &BTreeMap<String, String>,
    ) -> Self {
        let mut merged = serde_json::Map::new();
        for (k, v) in reply_headers {
            merged.insert(k.clone(), Value::String(v.clone()));
        }
        merged.insert(
            headers::MESSAGE_ID.to_string(),
            Value::String(Uuid::new_v4().to_string()),
        );
        merged.insert(
            headers::COMMAND_ID.to_string(),
            Value::String(command_id.to_string()),
        );
        merged.insert(
            headers::COMMAND_NAME.to_string(),
            Value::String(name.to_string()),
        );
        merged.insert(
            headers::BUSINESS_KEY.to_string(),
            Value::String(business_key.to_string()),
        );
        merged
            .entry(headers::REPLY_TO.to_string())
            .or_insert_with(|| Value::String(naming.reply_queue.clone()));
        // plain submissions correlate replies by command id
        merged
            .entry(headers::CORRELATION_ID.to_string())
            .or_insert_with(|| Value::String(command_id.to_string()));

        Self {
            category: OutboxCategory::Command,
            topic: Some(naming.command_queue(name)),
            key: Some(business_key.to_string()),
            message_type: "CommandRequested".to_string(),
            payload,
            headers: Value::Object(merged),
        }
    }

    /// A Kafka event bound for an explicit topic.
    pub fn kafka_event(topic: &str, key: Option<&str>, message_type: &str, payload: Value) -> Self {
        Self {
            category: OutboxCategory::Event,
            topic: Some(topic.to_string()),
            key: key.map(str::to_string),
            message_type: message_type.to_string(),
            payload,
            headers: Value::Object(serde_json::Map::new()),
        }
    }

    /// A reply bound for the requester's `replyTo` queue, or the configured
    /// default reply queue when none was named.
    pub fn mq_reply(
        naming: &QueueNaming,
        reply_to: Option<&str>,
        correlation_id: &str,
        message_type: &str,
        payload: Value,
    ) -> Self {
        let mut hdrs = serde_json::Map::new();
        hdrs.insert(
            headers::CORRELATION_ID.to_string(),
            Value::String(correlation_id.to_string()),
        );

        Self {
            category: OutboxCategory::Reply,
            topic: Some(
                reply_to
                    .filter(|q| !q.is_empty())
                    .unwrap_or(naming.reply_queue.as_str())
                    .to_string(),
            ),
            key: None,
            message_type: message_type.to_string(),
            payload,
            headers: Value::Object(hdrs),
        }
    }
}

/// Clamped exponential backoff: `min(max_backoff, 2^min(attempts, 8))`
/// seconds.
pub fn backoff_delay(attempts: i32, max_backoff: Duration) -> Duration {
    let exp = attempts.clamp(0, 8) as u32;
    Duration::from_secs(1u64 << exp).min(max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_schedule() {
        let max = Duration::from_millis(300_000);
        assert_eq!(backoff_delay(0, max).as_secs(), 1);
        assert_eq!(backoff_delay(1, max).as_secs(), 2);
        assert_eq!(backoff_delay(2, max).as_secs(), 4);
        assert_eq!(backoff_delay(3, max).as_secs(), 8);
        assert_eq!(backoff_delay(8, max).as_secs(), 256);
        // exponent clamps at 8, then the max clamps the result
        assert_eq!(backoff_delay(20, max).as_secs(), 256);
        assert_eq!(
            backoff_delay(20, Duration::from_secs(60)).as_secs(),
            60
        );
    }

    #[test]
    fn test_command_requested_headers() {
        let naming = QueueNaming::default();
        let command_id = Uuid::new_v4();
        let mut reply = BTreeMap::new();
        reply.insert("replyTo".to_string(), "payments.replies".to_string());

        let row = NewOutboxRow::command_requested(
            &naming,
            "CreateUser",
            command_id,
            "user-42",
            json!({"username": "a"}),
            &reply,
        );

        assert_eq!(row.category, OutboxCategory::Command);
        assert_eq!(row.topic.as_deref(), Some("commands.CreateUser"));
        assert_eq!(row.key.as_deref(), Some("user-42"));
        let hdrs = row.headers.as_object().unwrap();
        assert_eq!(
            hdrs["commandId"].as_str().unwrap(),
            command_id.to_string()
        );
        assert_eq!(hdrs["commandName"], json!("CreateUser"));
        assert_eq!(hdrs["businessKey"], json!("user-42"));
        // caller's replyTo wins over the configured default
        assert_eq!(hdrs["replyTo"], json!("payments.replies"));
        assert!(hdrs.contains_key("messageId"));
        // no caller correlation: replies correlate by command id
        assert_eq!(
            hdrs["correlationId"].as_str().unwrap(),
            command_id.to_string()
        );
    }

    #[test]
    fn test_mq_reply_falls_back_to_default_queue() {
        let naming = QueueNaming::default();

        let explicit = NewOutboxRow::mq_reply(
            &naming,
            Some("caller.replies"),
            "corr-1",
            "CommandCompleted",
            json!({}),
        );
        assert_eq!(explicit.topic.as_deref(), Some("caller.replies"));

        let fallback =
            NewOutboxRow::mq_reply(&naming, None, "corr-1", "CommandCompleted", json!({}));
        assert_eq!(fallback.topic.as_deref(), Some("replies"));
        assert_eq!(
            fallback.headers.as_object().unwrap()["correlationId"],
            json!("corr-1")
        );
    }

    #[test]
    fn test_queue_and_topic_naming() {
        let queues = QueueNaming {
            command_prefix: "cmd.".to_string(),
            queue_suffix: ".in".to_string(),
            reply_queue: "replies".to_string(),
        };
        assert_eq!(queues.command_queue("BookLimits"), "cmd.BookLimits.in");

        let topics = TopicNaming::default();
        assert_eq!(topics.event_topic("CreateUser"), "events.CreateUser");
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            OutboxStatus::New,
            OutboxStatus::Claimed,
            OutboxStatus::Published,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("PARKED"), None);
    }
}
