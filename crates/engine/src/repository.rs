//! Notification repository: persistence of notification records and the
//! queries the delivery pipeline, REST surface and sweeps rely on.
//!
//! Status transitions that the delivery pipeline performs are conditional on
//! the row still being `pending`, so a duplicate job can never move a
//! delivered or read notification backwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};

use beacon_common::error::AppError;
use beacon_common::types::{
    ChannelType, Notification, NotificationStats, NotificationStatus, Priority, User,
};

/// Rows per page on list queries.
pub const PAGE_SIZE: i64 = 50;

/// Fields of a notification supplied at creation time.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: i64,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub channel: ChannelType,
    pub data: serde_json::Value,
}

/// Partial update; `None` leaves the column unchanged.
#[derive(Debug, Clone, Default)]
pub struct NotificationUpdate {
    pub title: Option<String>,
    pub message: Option<String>,
    pub priority: Option<Priority>,
    pub channel: Option<ChannelType>,
    pub data: Option<serde_json::Value>,
}

/// Filters shared by list and stats queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationFilter {
    pub status: Option<NotificationStatus>,
    pub priority: Option<Priority>,
    pub user_id: Option<i64>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

/// One page of results plus the total count across all pages.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub count: i64,
    pub page: u32,
    pub results: Vec<T>,
}

/// A user with unread notifications inside the digest window.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DigestCandidate {
    pub user_id: i64,
    pub unread: i64,
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, AppError>;

    async fn get(&self, id: i64) -> Result<Option<Notification>, AppError>;

    /// Newest first, `PAGE_SIZE` per page, pages numbered from 1.
    async fn list(
        &self,
        filter: &NotificationFilter,
        page: u32,
    ) -> Result<Page<Notification>, AppError>;

    async fn update(
        &self,
        id: i64,
        update: &NotificationUpdate,
    ) -> Result<Option<Notification>, AppError>;

    async fn delete(&self, id: i64) -> Result<bool, AppError>;

    /// `pending -> delivered`. Returns `None` if the row is gone or no longer pending.
    async fn mark_delivered(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError>;

    /// Any status -> `read`, overwriting `read_at` on every call.
    async fn mark_read(&self, id: i64, at: DateTime<Utc>)
    -> Result<Option<Notification>, AppError>;

    /// `pending -> failed`. Returns `None` if the row is gone or no longer pending.
    async fn mark_failed(
        &self,
        id: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError>;

    /// Bump `delivery_attempts` and stamp `last_attempt_at`.
    async fn increment_attempts(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError>;

    /// Pending notifications for a user, newest first.
    async fn pending_for_user(&self, user_id: i64, limit: i64)
    -> Result<Vec<Notification>, AppError>;

    async fn count_pending(&self) -> Result<i64, AppError>;

    /// Delete `read` notifications of `priority` created before `cutoff`.
    async fn delete_read_before(
        &self,
        priority: Priority,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    /// Users with `pending`/`delivered` notifications created since `since`.
    async fn digest_candidates(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<DigestCandidate>, AppError>;

    /// A user's `pending`/`delivered` notifications created since `since`, newest first.
    async fn recent_unread(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError>;

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, AppError>;

    async fn stats(&self, filter: &NotificationFilter) -> Result<NotificationStats, AppError>;
}

/// PostgreSQL implementation of [`NotificationRepository`].
#[derive(Clone)]
pub struct PgNotificationRepository {
    pool: PgPool,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &NotificationFilter) {
        qb.push(" WHERE TRUE");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(priority) = filter.priority {
            qb.push(" AND priority = ").push_bind(priority.as_str());
        }
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(from) = filter.date_from {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.date_to {
            qb.push(" AND created_at <= ").push_bind(to);
        }
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, AppError> {
        let notification: Notification = sqlx::query_as(
            r#"
            INSERT INTO notifications (user_id, title, message, priority, channel, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(&new.title)
        .bind(&new.message)
        .bind(new.priority.as_str())
        .bind(new.channel.as_str())
        .bind(&new.data)
        .fetch_one(&self.pool)
        .await?;

        Ok(notification)
    }

    async fn get(&self, id: i64) -> Result<Option<Notification>, AppError> {
        let notification = sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(notification)
    }

    async fn list(
        &self,
        filter: &NotificationFilter,
        page: u32,
    ) -> Result<Page<Notification>, AppError> {
        let page = page.max(1);

        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM notifications");
        Self::push_filters(&mut count_qb, filter);
        let (count,): (i64,) = count_qb.build_query_as().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::new("SELECT * FROM notifications");
        Self::push_filters(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(PAGE_SIZE)
            .push(" OFFSET ")
            .push_bind((page as i64 - 1) * PAGE_SIZE);
        let results: Vec<Notification> = qb.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page {
            count,
            page,
            results,
        })
    }

    async fn update(
        &self,
        id: i64,
        update: &NotificationUpdate,
    ) -> Result<Option<Notification>, AppError> {
        let notification = sqlx::query_as(
            r#"
            UPDATE notifications
            SET title = COALESCE($2, title),
                message = COALESCE($3, message),
                priority = COALESCE($4, priority),
                channel = COALESCE($5, channel),
                data = COALESCE($6, data)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.title.as_deref())
        .bind(update.message.as_deref())
        .bind(update.priority.map(|p| p.as_str()))
        .bind(update.channel.map(|c| c.as_str()))
        .bind(update.data.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        Ok(notification)
    }

    async fn delete(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_delivered(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        let notification = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'delivered', delivered_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(notification)
    }

    async fn mark_read(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        let notification = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'read',
                read_at = $2,
                delivered_at = COALESCE(delivered_at, $2),
                failure_reason = NULL
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(notification)
    }

    async fn mark_failed(
        &self,
        id: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        let notification = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = 'failed', failure_reason = $2, last_attempt_at = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(notification)
    }

    async fn increment_attempts(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        let notification = sqlx::query_as(
            r#"
            UPDATE notifications
            SET delivery_attempts = delivery_attempts + 1, last_attempt_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(notification)
    }

    async fn pending_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1 AND status = 'pending'
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    async fn count_pending(&self) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn delete_read_before(
        &self,
        priority: Priority,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM notifications
            WHERE priority = $1 AND status = 'read' AND created_at < $2
            "#,
        )
        .bind(priority.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn digest_candidates(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<DigestCandidate>, AppError> {
        let candidates = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS unread
            FROM notifications
            WHERE status IN ('pending', 'delivered') AND created_at >= $1
            GROUP BY user_id
            ORDER BY user_id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(candidates)
    }

    async fn recent_unread(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1
              AND status IN ('pending', 'delivered')
              AND created_at >= $2
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn stats(&self, filter: &NotificationFilter) -> Result<NotificationStats, AppError> {
        let mut qb = QueryBuilder::new(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'delivered'),
                COUNT(*) FILTER (WHERE status = 'read'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COUNT(*) FILTER (WHERE status = 'pending'),
                (AVG(EXTRACT(EPOCH FROM (delivered_at - created_at)))
                    FILTER (WHERE status IN ('delivered', 'read') AND delivered_at IS NOT NULL)
                )::float8
            FROM notifications
            "#,
        );
        Self::push_filters(&mut qb, filter);

        let (total, delivered, read, failed, pending, avg_latency): (
            i64,
            i64,
            i64,
            i64,
            i64,
            Option<f64>,
        ) = qb.build_query_as().fetch_one(&self.pool).await?;

        Ok(NotificationStats::from_counts(
            total,
            delivered,
            read,
            failed,
            pending,
            avg_latency,
        ))
    }
}
