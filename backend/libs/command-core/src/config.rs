//! Configuration for the command pipeline.

use std::time::Duration;
use transactional_outbox::{QueueNaming, TopicNaming};
use uuid::Uuid;

/// Tuning knobs for bus and executor. Configuration is a plain struct
/// passed in by the embedding service; there are no global handles.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Lease a RUNNING command holds before redelivery may take over
    pub command_lease: Duration,
    /// How long processed inbox entries are retained before cleanup
    pub inbox_retention: Duration,
    /// MQ queue naming
    pub queues: QueueNaming,
    /// Kafka topic naming
    pub topics: TopicNaming,
    /// Recorded as `parked_by` on DLQ entries
    pub worker_id: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            command_lease: Duration::from_secs(60),
            inbox_retention: Duration::from_secs(7 * 86400),
            queues: QueueNaming::default(),
            topics: TopicNaming::default(),
            worker_id: format!("executor-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            command_lease: std::env::var("COMMAND_LEASE_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.command_lease),
            inbox_retention: std::env::var("INBOX_RETENTION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.inbox_retention),
            queues: QueueNaming::from_env(),
            topics: TopicNaming::from_env(),
            worker_id: std::env::var("HOSTNAME").unwrap_or(defaults.worker_id),
        }
    }
}
