// service/queue.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::service::error::ServiceError;
use crate::service::retry::{backoff_delay, RetryPolicy};

pub const TOPIC_FULFILLMENT: &str = "activation:jobs";
pub const TOPIC_NOTIFICATIONS: &str = "activation:notifications";

/// Duplicate deliveries of the same logical event are collapsed inside this
/// window. The broker-level window is best-effort only; the processor's
/// idempotency check is the real at-most-once guard.
pub const DEDUPE_WINDOW_SECS: u64 = 900;

pub const FULFILLMENT_MAX_RETRIES: u32 = 5;
pub const NOTIFICATION_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Fulfillment,
    Notification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub job_id: String,
    pub kind: JobKind,
    pub payment_id: Option<String>,
    pub reference: Option<String>,
    pub correlation_id: String,
    pub attempt: u32,
    pub max_retries: u32,
    pub received_at: DateTime<Utc>,
    pub dedupe_key: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl QueueJob {
    pub fn fulfillment(payment_id: &str, correlation_id: &str) -> QueueJob {
        QueueJob {
            job_id: Uuid::new_v4().to_string(),
            kind: JobKind::Fulfillment,
            payment_id: Some(payment_id.to_string()),
            reference: None,
            correlation_id: correlation_id.to_string(),
            attempt: 0,
            max_retries: FULFILLMENT_MAX_RETRIES,
            received_at: Utc::now(),
            dedupe_key: Some(webhook_dedupe_key(payment_id)),
            not_before: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn notification(
        payment_id: &str,
        reference: &str,
        correlation_id: &str,
        data: serde_json::Value,
    ) -> QueueJob {
        QueueJob {
            job_id: Uuid::new_v4().to_string(),
            kind: JobKind::Notification,
            payment_id: Some(payment_id.to_string()),
            reference: Some(reference.to_string()),
            correlation_id: correlation_id.to_string(),
            attempt: 0,
            max_retries: NOTIFICATION_MAX_RETRIES,
            received_at: Utc::now(),
            dedupe_key: Some(format!("notify-{}", payment_id)),
            not_before: None,
            data,
        }
    }

    /// Prepare the redelivery copy of a failed job, or `None` when the retry
    /// budget is exhausted. Redeliveries drop the dedupe key (it is already
    /// burned) and carry a not-before backoff timestamp.
    pub fn retry_after(&self, delay: Duration) -> Option<QueueJob> {
        let next_attempt = self.attempt + 1;
        if next_attempt >= self.max_retries {
            return None;
        }
        let mut job = self.clone();
        job.attempt = next_attempt;
        job.dedupe_key = None;
        job.not_before = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        Some(job)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.not_before {
            Some(not_before) => now >= not_before,
            None => true,
        }
    }
}

pub fn webhook_dedupe_key(payment_id: &str) -> String {
    format!("webhook-{}", payment_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Enqueued { job_id: String },
    /// The dedupe key was already claimed inside the window; treated as a
    /// successful no-op by every caller.
    Deduplicated { dedupe_key: String },
}

#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, topic: &str, job: &QueueJob) -> Result<PublishOutcome, ServiceError>;
}

#[derive(Clone)]
pub struct RedisJobQueue {
    redis: Arc<ConnectionManager>,
}

impl RedisJobQueue {
    pub fn new(redis: Arc<ConnectionManager>) -> Self {
        RedisJobQueue { redis }
    }

    /// Blocking pop with a small timeout; `None` on timeout. Payloads that do
    /// not deserialize are parked on the `<topic>:bad` list.
    pub async fn pop(&self, topic: &str, timeout_secs: u64) -> Result<Option<QueueJob>, ServiceError> {
        let mut conn = ConnectionManager::clone(&self.redis);
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(topic)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some((_key, payload)) = popped else {
            return Ok(None);
        };

        match serde_json::from_str::<QueueJob>(&payload) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                tracing::error!("queue {}: invalid job payload: {} ; payload: {}", topic, e, payload);
                let _: Result<(), _> = redis::cmd("LPUSH")
                    .arg(format!("{}:bad", topic))
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await;
                Ok(None)
            }
        }
    }

    /// Put a not-yet-due job back at the far end of the list.
    pub async fn requeue(&self, topic: &str, job: &QueueJob) -> Result<(), ServiceError> {
        let mut conn = ConnectionManager::clone(&self.redis);
        let payload = serde_json::to_string(job)
            .map_err(|e| ServiceError::Queue(format!("serialize job: {}", e)))?;
        let _: () = redis::cmd("LPUSH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn dead_letter(&self, topic: &str, job: &QueueJob) -> Result<(), ServiceError> {
        let mut conn = ConnectionManager::clone(&self.redis);
        let payload = serde_json::to_string(job)
            .map_err(|e| ServiceError::Queue(format!("serialize job: {}", e)))?;
        let _: () = redis::cmd("LPUSH")
            .arg(format!("{}:dead", topic))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobPublisher for RedisJobQueue {
    async fn publish(&self, topic: &str, job: &QueueJob) -> Result<PublishOutcome, ServiceError> {
        let mut conn = ConnectionManager::clone(&self.redis);

        if let Some(dedupe_key) = &job.dedupe_key {
            let claimed: Option<String> = redis::cmd("SET")
                .arg(format!("dedupe:{}:{}", topic, dedupe_key))
                .arg(&job.job_id)
                .arg("NX")
                .arg("EX")
                .arg(DEDUPE_WINDOW_SECS)
                .query_async(&mut conn)
                .await?;

            if claimed.is_none() {
                return Ok(PublishOutcome::Deduplicated {
                    dedupe_key: dedupe_key.clone(),
                });
            }
        }

        let payload = serde_json::to_string(job)
            .map_err(|e| ServiceError::Queue(format!("serialize job: {}", e)))?;
        let _: () = redis::cmd("LPUSH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        Ok(PublishOutcome::Enqueued {
            job_id: job.job_id.clone(),
        })
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueueJob) -> Result<(), ServiceError>;
}

/// Queue consumer loop. Pops jobs from one topic, dispatches them to the
/// handler, and drives the bounded-retry/dead-letter policy on failure.
pub struct Worker {
    queue: RedisJobQueue,
    topic: String,
    handler: Arc<dyn JobHandler>,
    retry_policy: RetryPolicy,
    idle_sleep: Duration,
}

impl Worker {
    pub fn new(queue: RedisJobQueue, topic: &str, handler: Arc<dyn JobHandler>) -> Self {
        Worker {
            queue,
            topic: topic.to_string(),
            handler,
            retry_policy: RetryPolicy::new(FULFILLMENT_MAX_RETRIES, Duration::from_secs(5)),
            idle_sleep: Duration::from_secs(2),
        }
    }

    /// Run until the provided shutdown future resolves.
    pub async fn run_forever(&self, shutdown: impl std::future::Future<Output = ()>) {
        let mut shutdown = Box::pin(shutdown);

        loop {
            if futures::future::poll_immediate(&mut shutdown).await.is_some() {
                tracing::info!("worker {}: shutdown requested, exiting loop", self.topic);
                break;
            }

            match self.queue.pop(&self.topic, 5).await {
                Ok(Some(job)) => self.dispatch(job).await,
                Ok(None) => {
                    // timeout, no data
                }
                Err(e) => {
                    tracing::error!("worker {}: pop error: {}", self.topic, e);
                    sleep(self.idle_sleep).await;
                }
            }
        }

        tracing::info!("worker {}: stopped", self.topic);
    }

    async fn dispatch(&self, job: QueueJob) {
        if !job.is_due(Utc::now()) {
            // Backoff delivery: park it back and avoid a tight loop.
            if let Err(e) = self.queue.requeue(&self.topic, &job).await {
                tracing::error!("worker {}: requeue of delayed job {} failed: {}", self.topic, job.job_id, e);
            }
            sleep(Duration::from_millis(500)).await;
            return;
        }

        match self.handler.handle(&job).await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(
                    "worker {}: job {} (attempt {}/{}) failed: {} [correlation_id={}]",
                    self.topic,
                    job.job_id,
                    job.attempt + 1,
                    job.max_retries,
                    e,
                    job.correlation_id
                );

                let delay = backoff_delay(&self.retry_policy, job.attempt + 1);
                match job.retry_after(delay) {
                    Some(retry) => {
                        if let Err(e) = self.queue.requeue(&self.topic, &retry).await {
                            tracing::error!(
                                "worker {}: failed to requeue job {}: {}",
                                self.topic,
                                retry.job_id,
                                e
                            );
                        }
                    }
                    None => {
                        tracing::error!(
                            "worker {}: job {} exhausted {} attempts, dead-lettering [correlation_id={}]",
                            self.topic,
                            job.job_id,
                            job.max_retries,
                            job.correlation_id
                        );
                        if let Err(e) = self.queue.dead_letter(&self.topic, &job).await {
                            tracing::error!(
                                "worker {}: dead-letter of job {} failed: {}",
                                self.topic,
                                job.job_id,
                                e
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_key_is_deterministic() {
        assert_eq!(webhook_dedupe_key("pay-1"), "webhook-pay-1");
        assert_eq!(
            QueueJob::fulfillment("pay-1", "corr").dedupe_key,
            QueueJob::fulfillment("pay-1", "other-corr").dedupe_key
        );
    }

    #[test]
    fn retry_increments_attempt_and_drops_dedupe() {
        let job = QueueJob::fulfillment("pay-1", "corr");
        let retry = job.retry_after(Duration::from_secs(5)).unwrap();
        assert_eq!(retry.attempt, 1);
        assert!(retry.dedupe_key.is_none());
        assert!(retry.not_before.is_some());
        assert_eq!(retry.job_id, job.job_id);
    }

    #[test]
    fn retry_budget_is_bounded() {
        let mut job = QueueJob::fulfillment("pay-1", "corr");
        job.max_retries = 2;
        let retry = job.retry_after(Duration::from_secs(1)).unwrap();
        assert!(retry.retry_after(Duration::from_secs(1)).is_none());
    }

    #[test]
    fn due_check_respects_not_before() {
        let now = Utc::now();
        let mut job = QueueJob::fulfillment("pay-1", "corr");
        assert!(job.is_due(now));
        job.not_before = Some(now + chrono::Duration::seconds(30));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = QueueJob::notification(
            "pay-9",
            "MG_ABC",
            "corr-1",
            serde_json::json!({"email": "ana@example.com"}),
        );
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: QueueJob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.kind, JobKind::Notification);
        assert_eq!(decoded.payment_id.as_deref(), Some("pay-9"));
        assert_eq!(decoded.data["email"], "ana@example.com");
    }
}
