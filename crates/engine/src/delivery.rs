//! Delivery orchestrator: the online/offline decision for a notification.
//!
//! ```text
//! pending ──push ok──▶ delivered ──mark_read──▶ read
//!    │
//!    └──retries exhausted──▶ failed (handed off to email)
//! ```
//!
//! A notification whose user is offline, or whose push fails or times out,
//! stays `pending` and is handed to the retry queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use beacon_common::error::AppError;
use beacon_common::metrics::MetricsSink;
use beacon_common::types::Notification;

use crate::gateway::{Gateway, ServerMessage};
use crate::presence::PresenceStore;
use crate::repository::NotificationRepository;
use crate::retry::{JobQueue, RetryJob};

/// Delay before the first retry of a notification that could not be pushed.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Default bound on a single gateway send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Pushed to the user's connections and marked delivered.
    Delivered(Notification),
    /// Left pending with a retry job scheduled after `delay`.
    Queued { delay: Duration },
    /// The notification had already left `pending` when the push landed.
    AlreadyHandled,
}

/// Result of a single push attempt through the gateway.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PushResult {
    Delivered(Notification),
    AlreadyHandled,
    Failed,
}

pub struct DeliveryOrchestrator {
    pub(crate) presence: Arc<dyn PresenceStore>,
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) repository: Arc<dyn NotificationRepository>,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    send_timeout: Duration,
}

impl DeliveryOrchestrator {
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        gateway: Arc<dyn Gateway>,
        repository: Arc<dyn NotificationRepository>,
        queue: Arc<dyn JobQueue>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            presence,
            gateway,
            repository,
            queue,
            metrics,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Deliver now if the user is online, otherwise queue the first retry.
    pub async fn deliver(&self, notification: &Notification) -> Result<DeliveryOutcome, AppError> {
        if self.is_online(notification.user_id).await {
            match self.push(notification).await? {
                PushResult::Delivered(updated) => return Ok(DeliveryOutcome::Delivered(updated)),
                PushResult::AlreadyHandled => return Ok(DeliveryOutcome::AlreadyHandled),
                PushResult::Failed => {}
            }
        }

        self.schedule_retry(notification.id, 1, INITIAL_RETRY_DELAY)
            .await?;

        tracing::info!(
            notification_id = notification.id,
            user_id = notification.user_id,
            delay_secs = INITIAL_RETRY_DELAY.as_secs(),
            "Notification queued for retry"
        );

        Ok(DeliveryOutcome::Queued {
            delay: INITIAL_RETRY_DELAY,
        })
    }

    /// Presence lookup where a store error counts as offline.
    pub(crate) async fn is_online(&self, user_id: i64) -> bool {
        match self.presence.is_online(user_id).await {
            Ok(online) => online,
            Err(e) => {
                tracing::warn!(
                    user_id,
                    error = %e,
                    "Presence lookup failed, treating user as offline"
                );
                false
            }
        }
    }

    /// One gateway send bounded by the send timeout; on success move the
    /// notification to `delivered` and record latency.
    pub(crate) async fn push(&self, notification: &Notification) -> Result<PushResult, AppError> {
        let message = ServerMessage::Notification {
            notification: notification.clone(),
        };

        let send = self.gateway.send(notification.user_id, &message);
        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    notification_id = notification.id,
                    user_id = notification.user_id,
                    error = %e,
                    "Gateway send failed"
                );
                return Ok(PushResult::Failed);
            }
            Err(_) => {
                tracing::warn!(
                    notification_id = notification.id,
                    user_id = notification.user_id,
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Gateway send timed out"
                );
                return Ok(PushResult::Failed);
            }
        }

        let Some(updated) = self
            .repository
            .mark_delivered(notification.id, Utc::now())
            .await?
        else {
            tracing::debug!(
                notification_id = notification.id,
                "Notification no longer pending after push"
            );
            return Ok(PushResult::AlreadyHandled);
        };

        let latency = updated.delivery_latency_seconds().unwrap_or(0.0);
        self.metrics
            .notification_delivered(updated.priority, updated.channel, latency);

        tracing::info!(
            notification_id = updated.id,
            user_id = updated.user_id,
            priority = %updated.priority,
            latency_secs = latency,
            "Notification delivered"
        );

        Ok(PushResult::Delivered(updated))
    }

    pub(crate) async fn schedule_retry(
        &self,
        notification_id: i64,
        attempt: u32,
        delay: Duration,
    ) -> Result<RetryJob, AppError> {
        let job = RetryJob::new(notification_id, attempt, delay);
        self.queue.schedule(&job).await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use beacon_common::types::NotificationStatus;

    use super::*;
    use crate::testing::{Harness, ScriptedGateway};

    #[tokio::test]
    async fn test_online_user_is_delivered() {
        let harness = Harness::new();
        harness.presence.mark_online(1).await.unwrap();
        let notification = harness.insert(1, "Hello").await;

        let outcome = harness.orchestrator.deliver(&notification).await.unwrap();

        let DeliveryOutcome::Delivered(updated) = outcome else {
            panic!("expected delivery, got {:?}", outcome);
        };
        assert_eq!(updated.status, NotificationStatus::Delivered);
        assert!(updated.delivered_at.unwrap() >= updated.created_at);
        assert_eq!(harness.metrics.latencies().len(), 1);
        assert!(harness.metrics.latencies()[0] >= 0.0);
        assert!(harness.queue.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_user_is_queued() {
        let harness = Harness::new();
        let notification = harness.insert(1, "Hello").await;

        let outcome = harness.orchestrator.deliver(&notification).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Queued { delay: INITIAL_RETRY_DELAY });
        let jobs = harness.queue.pending().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt, 1);
        assert_eq!(jobs[0].delay_secs, 60);

        let stored = harness.repository.get(notification.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Pending);
        assert_eq!(stored.delivery_attempts, 0);
    }

    #[tokio::test]
    async fn test_failed_push_falls_back_to_queue() {
        let harness = Harness::with_gateway(Arc::new(ScriptedGateway::failing()));
        harness.presence.mark_online(1).await.unwrap();
        let notification = harness.insert(1, "Hello").await;

        let outcome = harness.orchestrator.deliver(&notification).await.unwrap();

        assert!(matches!(outcome, DeliveryOutcome::Queued { .. }));
        assert!(harness.metrics.latencies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_push_times_out() {
        let harness = Harness::with_gateway(Arc::new(ScriptedGateway::stalled()));
        harness.presence.mark_online(1).await.unwrap();
        let notification = harness.insert(1, "Hello").await;

        let outcome = harness.orchestrator.deliver(&notification).await.unwrap();

        assert!(matches!(outcome, DeliveryOutcome::Queued { .. }));
    }

    #[tokio::test]
    async fn test_already_read_is_not_redelivered() {
        let harness = Harness::new();
        harness.presence.mark_online(1).await.unwrap();
        let notification = harness.insert(1, "Hello").await;
        harness
            .repository
            .mark_read(notification.id, Utc::now())
            .await
            .unwrap();

        let outcome = harness.orchestrator.deliver(&notification).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::AlreadyHandled);
        let stored = harness.repository.get(notification.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Read);
    }
}
