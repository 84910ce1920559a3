//! Background dispatcher for queued outbox rows.
//!
//! The sweeper is the correctness backbone: every tick it returns abandoned
//! claims to the queue, claims a batch of due rows, publishes each one to
//! its broker, and records the outcome. Rows are claimed inside a short
//! transaction, published outside any transaction, then marked inside
//! another short transaction, so no database connection is held across a
//! broker round trip.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PublishError;
use crate::metrics::OutboxMetrics;
use crate::publisher::{KafkaPublisher, MqPublisher};
use crate::store::OutboxStore;
use crate::{backoff_delay, OutboxRow};

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Interval between sweeps
    pub sweep_interval: Duration,
    /// Maximum rows claimed per sweep
    pub batch_size: i64,
    /// Age after which a CLAIMED row counts as abandoned
    pub claim_timeout: Duration,
    /// Upper clamp for the retry backoff
    pub max_backoff: Duration,
    /// Recorded as `claimed_by` on claimed rows
    pub host_id: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            batch_size: 500,
            claim_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_millis(300_000),
            host_id: format!("dispatcher-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sweep_interval: std::env::var("OUTBOX_SWEEP_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            batch_size: std::env::var("OUTBOX_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            claim_timeout: std::env::var("OUTBOX_CLAIM_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_timeout),
            max_backoff: std::env::var("OUTBOX_MAX_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            host_id: std::env::var("HOSTNAME").unwrap_or(defaults.host_id),
        }
    }
}

/// Publish one claimed row and record the outcome. Returns `true` when the
/// row reached PUBLISHED. Shared by the sweeper and the fast path.
pub(crate) async fn publish_claimed(
    store: &dyn OutboxStore,
    mq: &dyn MqPublisher,
    kafka: &dyn KafkaPublisher,
    row: &OutboxRow,
    max_backoff: Duration,
    metrics: Option<&OutboxMetrics>,
) -> bool {
    let outcome: Result<(), PublishError> = match (row.category.as_str(), row.topic.as_deref()) {
        ("command" | "reply", Some(topic)) => {
            mq.publish(
                topic,
                row.key.as_deref(),
                &row.message_type,
                &row.payload,
                &row.headers,
            )
            .await
        }
        ("event", Some(topic)) => {
            kafka
                .publish(
                    topic,
                    row.key.as_deref(),
                    &row.message_type,
                    &row.payload,
                    &row.headers,
                )
                .await
        }
        (_, None) => {
            let reason = format!("missing topic for category '{}'", row.category);
            error!(outbox_id = row.id, %reason, "Unpublishable outbox row");
            if let Err(e) = store.park_failed(row.id, &reason).await {
                error!(outbox_id = row.id, error = ?e, "Failed to park outbox row");
            }
            return false;
        }
        (other, _) => {
            let reason = format!("unknown category: {other}");
            error!(outbox_id = row.id, %reason, "Unpublishable outbox row");
            if let Err(e) = store.park_failed(row.id, &reason).await {
                error!(outbox_id = row.id, error = ?e, "Failed to park outbox row");
            }
            return false;
        }
    };

    match outcome {
        Ok(()) => {
            match store.mark_published(row.id).await {
                Ok(()) => {
                    if let Some(m) = metrics {
                        m.published.inc();
                    }
                    true
                }
                Err(e) => {
                    // Delivered to the broker but not recorded; the row will
                    // be republished and consumers must dedupe.
                    error!(
                        outbox_id = row.id,
                        error = ?e,
                        "Failed to mark published row (message was delivered)"
                    );
                    false
                }
            }
        }
        Err(PublishError::Transient(msg)) => {
            let delay = backoff_delay(row.attempts + 1, max_backoff);
            warn!(
                outbox_id = row.id,
                attempts = row.attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %msg,
                "Publish failed, rescheduling"
            );
            if let Err(e) = store.reschedule(row.id, delay, &msg).await {
                error!(outbox_id = row.id, error = ?e, "Failed to reschedule outbox row");
            } else if let Some(m) = metrics {
                m.rescheduled.inc();
            }
            false
        }
        Err(PublishError::Terminal(msg)) => {
            // Record the error and a throttle; the claim stays in place and
            // stuck recovery returns the row to the queue after the timeout.
            let next_at = chrono::Utc::now()
                + chrono::Duration::from_std(max_backoff)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            error!(
                outbox_id = row.id,
                error = %msg,
                "Terminal publish failure recorded"
            );
            if let Err(e) = store.mark_failed(row.id, &msg, next_at).await {
                error!(outbox_id = row.id, error = ?e, "Failed to record publish failure");
            }
            false
        }
    }
}

/// Periodic sweeper over the outbox table.
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    mq: Arc<dyn MqPublisher>,
    kafka: Arc<dyn KafkaPublisher>,
    config: DispatcherConfig,
    metrics: Option<OutboxMetrics>,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        mq: Arc<dyn MqPublisher>,
        kafka: Arc<dyn KafkaPublisher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            mq,
            kafka,
            config,
            metrics: None,
        }
    }

    /// Create a dispatcher that also updates Prometheus gauges each sweep.
    pub fn new_with_metrics(
        store: Arc<dyn OutboxStore>,
        mq: Arc<dyn MqPublisher>,
        kafka: Arc<dyn KafkaPublisher>,
        config: DispatcherConfig,
        metrics: OutboxMetrics,
    ) -> Self {
        Self {
            store,
            mq,
            kafka,
            config,
            metrics: Some(metrics),
        }
    }

    /// Run the sweep loop until the shutdown signal flips to `true`.
    ///
    /// Spawn this as a dedicated background task.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            claim_timeout_secs = self.config.claim_timeout.as_secs(),
            host_id = %self.config.host_id,
            "Outbox dispatcher starting"
        );

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(published) if published > 0 => {
                            info!(published_count = published, "Published outbox batch");
                        }
                        Ok(_) => debug!("No outbox rows to publish"),
                        Err(e) => error!(error = ?e, "Outbox sweep error"),
                    }

                    if let Some(metrics) = &self.metrics {
                        if let Ok((pending, age)) = self.store.pending_stats().await {
                            metrics.pending.set(pending);
                            metrics.oldest_pending_age_seconds.set(age);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Outbox dispatcher stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One sweep: recover abandoned claims, claim a batch, publish each row.
    /// Returns the number of rows that reached PUBLISHED.
    pub async fn sweep_once(&self) -> crate::OutboxResult<usize> {
        let recovered = self.store.recover_stuck(self.config.claim_timeout).await?;
        if recovered > 0 {
            warn!(recovered, "Recovered stuck outbox claims");
        }

        let batch = self
            .store
            .claim(self.config.batch_size, &self.config.host_id)
            .await?;

        let mut published = 0;
        for row in &batch {
            if publish_claimed(
                self.store.as_ref(),
                self.mq.as_ref(),
                self.kafka.as_ref(),
                row,
                self.config.max_backoff,
                self.metrics.as_ref(),
            )
            .await
            {
                published += 1;
            }
        }

        Ok(published)
    }
}
