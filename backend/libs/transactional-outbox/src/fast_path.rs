//! Optional Redis fast path for freshly committed outbox rows.
//!
//! A writer that just committed an outbox row may push its id onto a shared
//! Redis list; a listener pops ids, claims the specific row, and publishes
//! it immediately instead of waiting for the next sweep. The notification
//! channel is at-most-once: a lost or dropped id is benign because the
//! sweeper claims the row on its next tick. Correctness never depends on
//! this module.

use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::publish_claimed;
use crate::metrics::OutboxMetrics;
use crate::publisher::{KafkaPublisher, MqPublisher};
use crate::store::OutboxStore;

/// Fast path tuning knobs.
#[derive(Debug, Clone)]
pub struct FastPathConfig {
    /// Redis list the notifications travel on
    pub list_key: String,
    /// Maximum rows published concurrently by the listener
    pub concurrency: usize,
    /// Upper clamp for the retry backoff (shared with the sweeper)
    pub max_backoff: Duration,
    /// Recorded as `claimed_by` on rows claimed by this listener
    pub host_id: String,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            list_key: "outbox:fastpath".to_string(),
            concurrency: 32,
            max_backoff: Duration::from_millis(300_000),
            host_id: format!("fastpath-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl FastPathConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            list_key: std::env::var("FAST_PATH_LIST_KEY").unwrap_or(defaults.list_key),
            concurrency: std::env::var("FAST_PATH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.concurrency),
            max_backoff: std::env::var("OUTBOX_MAX_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            host_id: std::env::var("HOSTNAME").unwrap_or(defaults.host_id),
        }
    }
}

/// Producer side: best-effort post-commit notification.
#[derive(Clone)]
pub struct FastPathNotifier {
    conn: ConnectionManager,
    list_key: String,
}

impl FastPathNotifier {
    pub fn new(conn: ConnectionManager, list_key: impl Into<String>) -> Self {
        Self {
            conn,
            list_key: list_key.into(),
        }
    }

    /// Push a committed outbox id onto the notification list. Failures are
    /// swallowed: the sweeper remains the delivery guarantee.
    pub async fn notify(&self, id: i64) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = redis::cmd("RPUSH")
            .arg(&self.list_key)
            .arg(id)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => debug!(outbox_id = id, "Fast-path notification queued"),
            Err(e) => debug!(outbox_id = id, error = %e, "Fast-path notification dropped"),
        }
    }
}

/// Consumer side: pops notifications and publishes rows immediately.
pub struct FastPathListener {
    conn: ConnectionManager,
    store: Arc<dyn OutboxStore>,
    mq: Arc<dyn MqPublisher>,
    kafka: Arc<dyn KafkaPublisher>,
    permits: Arc<Semaphore>,
    config: FastPathConfig,
    metrics: Option<OutboxMetrics>,
}

impl FastPathListener {
    pub fn new(
        conn: ConnectionManager,
        store: Arc<dyn OutboxStore>,
        mq: Arc<dyn MqPublisher>,
        kafka: Arc<dyn KafkaPublisher>,
        config: FastPathConfig,
        metrics: Option<OutboxMetrics>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency));
        Self {
            conn,
            store,
            mq,
            kafka,
            permits,
            config,
            metrics,
        }
    }

    /// Run the listener loop until the shutdown signal flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            list_key = %self.config.list_key,
            concurrency = self.config.concurrency,
            "Outbox fast path listener starting"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Outbox fast path listener stopping");
                        break;
                    }
                }
                popped = self.pop_next() => {
                    match popped {
                        Ok(Some(id)) => self.handle_notification(id).await,
                        Ok(None) => {} // poll timeout, loop again
                        Err(e) => {
                            warn!(error = %e, "Fast path pop failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    async fn pop_next(&self) -> redis::RedisResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, i64)> = redis::cmd("BLPOP")
            .arg(&self.config.list_key)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, id)| id))
    }

    async fn handle_notification(&self, id: i64) {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let store = Arc::clone(&self.store);
                let mq = Arc::clone(&self.mq);
                let kafka = Arc::clone(&self.kafka);
                let metrics = self.metrics.clone();
                let max_backoff = self.config.max_backoff;
                let host_id = self.config.host_id.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    match store.claim_one(id, &host_id).await {
                        Ok(Some(row)) => {
                            publish_claimed(
                                store.as_ref(),
                                mq.as_ref(),
                                kafka.as_ref(),
                                &row,
                                max_backoff,
                                metrics.as_ref(),
                            )
                            .await;
                        }
                        // Not NEW anymore, deferred, or taken by a sweeper.
                        Ok(None) => debug!(outbox_id = id, "Fast path claim missed, dropping"),
                        Err(e) => warn!(outbox_id = id, error = ?e, "Fast path claim failed"),
                    }
                });
            }
            Err(_) => {
                // No permit free: requeue and let a later pop or the
                // sweeper pick it up.
                let mut conn = self.conn.clone();
                let requeued: redis::RedisResult<i64> = redis::cmd("RPUSH")
                    .arg(&self.config.list_key)
                    .arg(id)
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = requeued {
                    debug!(outbox_id = id, error = %e, "Fast path requeue dropped");
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
