//! Notification REST routes. Every route acts on the authenticated user's
//! own notifications.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use beacon_common::error::AppError;
use beacon_common::types::{Notification, NotificationStats};
use beacon_engine::repository::{NotificationFilter, Page};
use beacon_engine::service::{CreateNotification, PatchNotification};

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub const RATE_LIMIT_HEADER: &str = "x-ratelimit-remaining";

/// Rate-limiter action name for notification creation.
const CREATE_ACTION: &str = "create";

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/notifications",
            get(list_notifications).post(create_notification),
        )
        .route("/api/notifications/stats", get(notification_stats))
        .route(
            "/api/notifications/{id}",
            get(get_notification)
                .patch(update_notification)
                .delete(delete_notification),
        )
        .route("/api/notifications/{id}/mark_read", patch(mark_read))
}

/// Query string shared by list and stats.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
}

impl ListQuery {
    fn filter(&self) -> Result<NotificationFilter, AppError> {
        Ok(NotificationFilter {
            status: self
                .status
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(AppError::Validation)?,
            priority: self
                .priority
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(AppError::Validation)?,
            user_id: None,
            date_from: self.date_from,
            date_to: self.date_to,
        })
    }
}

/// GET /api/notifications: filtered, paginated list.
async fn list_notifications(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<Notification>>, AppError> {
    let filter = query.filter()?;
    let page = state
        .service
        .list(auth.user_id, filter, query.page.unwrap_or(1))
        .await?;
    Ok(Json(page))
}

/// POST /api/notifications: create a notification for the caller.
async fn create_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<CreateNotification>,
) -> Result<Response, AppError> {
    let raw_priority = params.priority.as_deref().unwrap_or("medium");
    let decision = state
        .rate_limiter
        .check_and_consume(auth.user_id, raw_priority, CREATE_ACTION)
        .await?;
    if !decision.allowed {
        tracing::info!(user_id = auth.user_id, priority = raw_priority, "Create rate limited");
        return Err(AppError::RateLimited {
            remaining: decision.remaining,
        });
    }

    let notification = state.service.create(auth.user_id, params).await?;

    Ok((
        StatusCode::CREATED,
        [(RATE_LIMIT_HEADER, decision.remaining.to_string())],
        Json(notification),
    )
        .into_response())
}

/// GET /api/notifications/stats
async fn notification_stats(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<NotificationStats>, AppError> {
    let stats = state.service.stats(auth.user_id, query.filter()?).await?;
    Ok(Json(stats))
}

/// GET /api/notifications/{id}
async fn get_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(state.service.get(auth.user_id, id).await?))
}

/// PATCH /api/notifications/{id}
async fn update_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(params): Json<PatchNotification>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(state.service.update(auth.user_id, id, params).await?))
}

/// DELETE /api/notifications/{id}
async fn delete_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.service.delete(auth.user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /api/notifications/{id}/mark_read
async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(state.service.mark_read(auth.user_id, id).await?))
}

#[cfg(test)]
mod tests {
    use beacon_common::types::{NotificationStatus, Priority};

    use super::*;

    #[test]
    fn test_list_query_parses_filters() {
        let query = ListQuery {
            status: Some("read".into()),
            priority: Some("low".into()),
            ..Default::default()
        };
        let filter = query.filter().unwrap();
        assert_eq!(filter.status, Some(NotificationStatus::Read));
        assert_eq!(filter.priority, Some(Priority::Low));
    }

    #[test]
    fn test_list_query_rejects_unknown_status() {
        let query = ListQuery {
            status: Some("archived".into()),
            ..Default::default()
        };
        assert!(matches!(query.filter(), Err(AppError::Validation(_))));
    }
}
