//! Notification service: validation, ownership and the create-then-deliver
//! path used by the REST surface.
//!
//! Every operation is scoped to the calling user: a notification owned by
//! someone else is reported as not found.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use beacon_common::error::AppError;
use beacon_common::metrics::MetricsSink;
use beacon_common::types::{ChannelType, Notification, NotificationStats, Priority};

use crate::delivery::{DeliveryOrchestrator, DeliveryOutcome};
use crate::repository::{
    NewNotification, NotificationFilter, NotificationRepository, NotificationUpdate, Page,
};

pub const MAX_TITLE_CHARS: usize = 255;
pub const MAX_MESSAGE_CHARS: usize = 5000;

/// Pending notifications pushed to a freshly connected socket.
pub const MISSED_NOTIFICATIONS_LIMIT: i64 = 50;

/// Body of a create request. Enumerations arrive as raw strings and are
/// parsed strictly here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateNotification {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    pub priority: Option<String>,
    pub channel: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Body of a partial update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatchNotification {
    pub title: Option<String>,
    pub message: Option<String>,
    pub priority: Option<String>,
    pub channel: Option<String>,
    pub data: Option<serde_json::Value>,
}

pub struct NotificationService {
    repository: Arc<dyn NotificationRepository>,
    orchestrator: Arc<DeliveryOrchestrator>,
    metrics: Arc<dyn MetricsSink>,
}

impl NotificationService {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        orchestrator: Arc<DeliveryOrchestrator>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            repository,
            orchestrator,
            metrics,
        }
    }

    /// Validate, persist and hand the notification to the orchestrator.
    ///
    /// Returns the stored row as it stands after the delivery attempt. An
    /// infrastructure error during delivery is logged; the notification stays
    /// pending.
    pub async fn create(
        &self,
        user_id: i64,
        params: CreateNotification,
    ) -> Result<Notification, AppError> {
        validate_title(&params.title)?;
        validate_message(&params.message)?;
        let priority = parse_or_default::<Priority>(params.priority.as_deref())?;
        let channel = parse_or_default::<ChannelType>(params.channel.as_deref())?;
        let data = params
            .data
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));

        let notification = self
            .repository
            .insert(&NewNotification {
                user_id,
                title: params.title,
                message: params.message,
                priority,
                channel,
                data,
            })
            .await?;

        self.metrics.notification_created(priority, channel);
        tracing::info!(
            notification_id = notification.id,
            user_id,
            priority = %priority,
            channel = %channel,
            "Notification created"
        );

        match self.orchestrator.deliver(&notification).await {
            Ok(DeliveryOutcome::Delivered(updated)) => Ok(updated),
            Ok(_) => Ok(notification),
            Err(e) => {
                tracing::error!(
                    notification_id = notification.id,
                    error = %e,
                    "Delivery failed after create"
                );
                Ok(notification)
            }
        }
    }

    pub async fn get(&self, user_id: i64, id: i64) -> Result<Notification, AppError> {
        self.repository
            .get(id)
            .await?
            .filter(|n| n.user_id == user_id)
            .ok_or_else(|| not_found(id))
    }

    pub async fn list(
        &self,
        user_id: i64,
        mut filter: NotificationFilter,
        page: u32,
    ) -> Result<Page<Notification>, AppError> {
        filter.user_id = Some(user_id);
        self.repository.list(&filter, page).await
    }

    pub async fn update(
        &self,
        user_id: i64,
        id: i64,
        params: PatchNotification,
    ) -> Result<Notification, AppError> {
        if let Some(title) = &params.title {
            validate_title(title)?;
        }
        if let Some(message) = &params.message {
            validate_message(message)?;
        }
        let update = NotificationUpdate {
            title: params.title,
            message: params.message,
            priority: params.priority.as_deref().map(parse_strict).transpose()?,
            channel: params.channel.as_deref().map(parse_strict).transpose()?,
            data: params.data,
        };

        self.get(user_id, id).await?;
        self.repository
            .update(id, &update)
            .await?
            .ok_or_else(|| not_found(id))
    }

    pub async fn delete(&self, user_id: i64, id: i64) -> Result<(), AppError> {
        self.get(user_id, id).await?;
        if !self.repository.delete(id).await? {
            return Err(not_found(id));
        }
        tracing::info!(notification_id = id, user_id, "Notification deleted");
        Ok(())
    }

    /// Mark read. Repeated calls overwrite `read_at`.
    pub async fn mark_read(&self, user_id: i64, id: i64) -> Result<Notification, AppError> {
        self.get(user_id, id).await?;
        self.repository
            .mark_read(id, Utc::now())
            .await?
            .ok_or_else(|| not_found(id))
    }

    pub async fn stats(
        &self,
        user_id: i64,
        mut filter: NotificationFilter,
    ) -> Result<NotificationStats, AppError> {
        filter.user_id = Some(user_id);
        self.repository.stats(&filter).await
    }

    /// Pending notifications for a user, newest first.
    pub async fn missed_for_user(&self, user_id: i64) -> Result<Vec<Notification>, AppError> {
        self.repository
            .pending_for_user(user_id, MISSED_NOTIFICATIONS_LIMIT)
            .await
    }
}

fn not_found(id: i64) -> AppError {
    AppError::NotFound(format!("Notification {} not found", id))
}

fn validate_title(title: &str) -> Result<(), AppError> {
    let len = title.trim().chars().count();
    if len == 0 {
        return Err(AppError::Validation("Title cannot be empty".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(AppError::Validation(format!(
            "Title cannot exceed {} characters",
            MAX_TITLE_CHARS
        )));
    }
    Ok(())
}

fn validate_message(message: &str) -> Result<(), AppError> {
    if message.trim().is_empty() {
        return Err(AppError::Validation("Message cannot be empty".into()));
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(AppError::Validation(format!(
            "Message cannot exceed {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    Ok(())
}

fn parse_strict<T>(raw: &str) -> Result<T, AppError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(AppError::Validation)
}

fn parse_or_default<T>(raw: Option<&str>) -> Result<T, AppError>
where
    T: std::str::FromStr<Err = String> + Default,
{
    raw.map(parse_strict).transpose().map(Option::unwrap_or_default)
}

#[cfg(test)]
mod tests {
    use beacon_common::types::NotificationStatus;

    use super::*;
    use crate::presence::PresenceStore;
    use crate::testing::Harness;

    fn params(title: &str) -> CreateNotification {
        CreateNotification {
            title: title.to_string(),
            message: "Body".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_applies_defaults_and_counts() {
        let harness = Harness::new();
        let created = harness.service.create(1, params("Hi")).await.unwrap();

        assert_eq!(created.priority, Priority::Medium);
        assert_eq!(created.channel, ChannelType::Websocket);
        assert_eq!(created.data, serde_json::json!({}));
        assert_eq!(created.status, NotificationStatus::Pending);
        assert_eq!(harness.metrics.created(), 1);
        assert_eq!(harness.queue.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_delivers_to_online_user() {
        let harness = Harness::new();
        harness.presence.mark_online(1).await.unwrap();

        let created = harness.service.create(1, params("Hi")).await.unwrap();

        assert_eq!(created.status, NotificationStatus::Delivered);
        assert_eq!(harness.gateway.sent_to(1).len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let harness = Harness::new();

        let blank = harness.service.create(1, params("   ")).await;
        assert!(matches!(blank, Err(AppError::Validation(_))));

        let long = harness.service.create(1, params(&"x".repeat(256))).await;
        assert!(matches!(long, Err(AppError::Validation(_))));

        let mut bad_priority = params("Hi");
        bad_priority.priority = Some("urgent".into());
        let err = harness.service.create(1, bad_priority).await.unwrap_err();
        assert!(err.to_string().contains("urgent"));

        let mut long_message = params("Hi");
        long_message.message = "m".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(harness.service.create(1, long_message).await.is_err());

        assert_eq!(harness.metrics.created(), 0);
    }

    #[tokio::test]
    async fn test_other_users_notifications_are_hidden() {
        let harness = Harness::new();
        let created = harness.service.create(1, params("Mine")).await.unwrap();

        assert!(matches!(
            harness.service.get(2, created.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(harness.service.mark_read(2, created.id).await.is_err());
        assert!(harness.service.delete(2, created.id).await.is_err());
        assert_eq!(
            harness.service.list(2, NotificationFilter::default(), 1).await.unwrap().count,
            0
        );
    }

    #[tokio::test]
    async fn test_mark_read_is_last_write_wins() {
        let harness = Harness::new();
        harness.presence.mark_online(1).await.unwrap();
        let created = harness.service.create(1, params("Hi")).await.unwrap();
        assert_eq!(created.status, NotificationStatus::Delivered);

        let first = harness.service.mark_read(1, created.id).await.unwrap();
        assert_eq!(first.status, NotificationStatus::Read);
        let first_read_at = first.read_at.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = harness.service.mark_read(1, created.id).await.unwrap();
        assert!(second.read_at.unwrap() > first_read_at);
        assert_eq!(second.delivered_at, first.delivered_at);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let harness = Harness::new();
        let created = harness.service.create(1, params("Old")).await.unwrap();

        let updated = harness
            .service
            .update(
                1,
                created.id,
                PatchNotification {
                    title: Some("New".into()),
                    priority: Some("high".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "New");
        assert_eq!(updated.priority, Priority::High);
        assert_eq!(updated.message, "Body");

        let bad = PatchNotification {
            channel: Some("pigeon".into()),
            ..Default::default()
        };
        assert!(harness.service.update(1, created.id, bad).await.is_err());

        harness.service.delete(1, created.id).await.unwrap();
        assert!(harness.service.get(1, created.id).await.is_err());
    }

    #[tokio::test]
    async fn test_missed_for_user_returns_pending_newest_first() {
        let harness = Harness::new();
        let older = harness.service.create(1, params("Older")).await.unwrap();
        let newer = harness.service.create(1, params("Newer")).await.unwrap();
        harness.repository.mark_read(older.id, Utc::now()).await.unwrap();
        let newest = harness.service.create(1, params("Newest")).await.unwrap();

        let missed = harness.service.missed_for_user(1).await.unwrap();
        let ids: Vec<i64> = missed.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![newest.id, newer.id]);
    }
}
