//! Broker publisher SPI.
//!
//! The dispatcher routes `command` and `reply` rows to an [`MqPublisher`]
//! and `event` rows to a [`KafkaPublisher`]. The MQ wire driver lives
//! outside this crate; embedding services supply their own implementation.
//! A Kafka implementation backed by rdkafka is provided here.

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use crate::error::PublishError;

/// Publisher for queue-oriented brokers (IBM MQ / JMS).
///
/// Implementations should be idempotent to handle republication safely.
#[async_trait]
pub trait MqPublisher: Send + Sync {
    async fn publish(
        &self,
        queue: &str,
        key: Option<&str>,
        message_type: &str,
        payload: &Value,
        headers: &Value,
    ) -> Result<(), PublishError>;
}

/// Publisher for topic-oriented brokers (Kafka).
#[async_trait]
pub trait KafkaPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        message_type: &str,
        payload: &Value,
        headers: &Value,
    ) -> Result<(), PublishError>;
}

/// Kafka-based implementation of [`KafkaPublisher`].
///
/// The producer MUST be configured with `enable.idempotence = true` and
/// `acks = all`; the outbox delivers at-least-once and duplicates are
/// suppressed by idempotent production plus idempotent consumers.
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaEventPublisher {
    pub fn new(producer: FutureProducer, delivery_timeout: Duration) -> Self {
        Self {
            producer,
            delivery_timeout,
        }
    }

    fn classify(err: KafkaError) -> PublishError {
        match err {
            KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge)
            | KafkaError::MessageProduction(RDKafkaErrorCode::InvalidMessage)
            | KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopic) => {
                PublishError::Terminal(format!("Kafka publish failed: {err}"))
            }
            other => PublishError::Transient(format!("Kafka publish failed: {other}")),
        }
    }
}

#[async_trait]
impl KafkaPublisher for KafkaEventPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        message_type: &str,
        payload: &Value,
        headers: &Value,
    ) -> Result<(), PublishError> {
        let payload_str = serde_json::to_string(payload)
            .map_err(|e| PublishError::Terminal(format!("unserializable payload: {e}")))?;

        let mut kafka_headers = OwnedHeaders::new().insert(Header {
            key: "type",
            value: Some(message_type.as_bytes()),
        });
        if let Some(map) = headers.as_object() {
            for (name, value) in map {
                if let Some(text) = value.as_str() {
                    kafka_headers = kafka_headers.insert(Header {
                        key: name,
                        value: Some(text.as_bytes()),
                    });
                }
            }
        }

        let mut record: FutureRecord<'_, str, String> = FutureRecord::to(topic)
            .payload(&payload_str)
            .headers(kafka_headers);
        if let Some(k) = key {
            record = record.key(k);
        }

        self.producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| Self::classify(err))?;

        info!(
            topic = %topic,
            message_type = %message_type,
            "Event published to Kafka"
        );

        Ok(())
    }
}
