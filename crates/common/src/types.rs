use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification priority levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!(
                "Invalid priority '{}'. Must be one of: high, medium, low",
                other
            )),
        }
    }
}

/// Notification delivery status.
///
/// `pending -> delivered -> read` is the success path, `pending -> failed`
/// the terminal failure path (which may still mean "handled via email").
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum NotificationStatus {
    #[default]
    Pending,
    Delivered,
    Read,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Read => "read",
            NotificationStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "delivered" => Ok(NotificationStatus::Delivered),
            "read" => Ok(NotificationStatus::Read),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(format!(
                "Invalid status '{}'. Must be one of: pending, delivered, read, failed",
                other
            )),
        }
    }
}

/// Channel a notification is addressed to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ChannelType {
    #[default]
    Websocket,
    Email,
    Both,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Websocket => "websocket",
            ChannelType::Email => "email",
            ChannelType::Both => "both",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "websocket" => Ok(ChannelType::Websocket),
            "email" => Ok(ChannelType::Email),
            "both" => Ok(ChannelType::Both),
            other => Err(format!(
                "Invalid channel '{}'. Must be one of: websocket, email, both",
                other
            )),
        }
    }
}

/// A user in the system.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub status: NotificationStatus,
    pub channel: ChannelType,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub delivery_attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Arbitrary payload, opaque to the delivery pipeline
    pub data: serde_json::Value,
}

impl Notification {
    /// Seconds between creation and delivery, if delivered.
    pub fn delivery_latency_seconds(&self) -> Option<f64> {
        self.delivered_at
            .map(|at| (at - self.created_at).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// Aggregate counters over a filtered set of notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationStats {
    pub total_notifications: i64,
    pub delivered_count: i64,
    pub read_count: i64,
    pub failed_count: i64,
    pub pending_count: i64,
    /// Percentage of notifications currently `delivered`
    pub delivery_rate: f64,
    /// Percentage of notifications currently `read`
    pub read_rate: f64,
    /// Mean seconds from creation to delivery over delivered/read rows
    pub avg_delivery_latency: f64,
}

impl NotificationStats {
    /// Fill in the derived rates from raw counts, rounding like the API reports them.
    pub fn from_counts(
        total: i64,
        delivered: i64,
        read: i64,
        failed: i64,
        pending: i64,
        avg_latency: Option<f64>,
    ) -> Self {
        let pct = |n: i64| {
            if total > 0 {
                round_to(n as f64 / total as f64 * 100.0, 2)
            } else {
                0.0
            }
        };

        Self {
            total_notifications: total,
            delivered_count: delivered,
            read_count: read,
            failed_count: failed,
            pending_count: pending,
            delivery_rate: pct(delivered),
            read_rate: pct(read),
            avg_delivery_latency: round_to(avg_latency.unwrap_or(0.0), 3),
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_round_trips_through_str() {
        for p in Priority::ALL {
            assert_eq!(p.as_str().parse::<Priority>().unwrap(), p);
        }
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_serde_uses_lowercase() {
        let json = serde_json::to_string(&ChannelType::Websocket).unwrap();
        assert_eq!(json, "\"websocket\"");
        let status: NotificationStatus = serde_json::from_str("\"delivered\"").unwrap();
        assert_eq!(status, NotificationStatus::Delivered);
    }

    #[test]
    fn test_stats_rates() {
        let stats = NotificationStats::from_counts(3, 1, 1, 0, 1, Some(0.12345));
        assert_eq!(stats.delivery_rate, 33.33);
        assert_eq!(stats.read_rate, 33.33);
        assert_eq!(stats.avg_delivery_latency, 0.123);
    }

    #[test]
    fn test_stats_empty() {
        let stats = NotificationStats::from_counts(0, 0, 0, 0, 0, None);
        assert_eq!(stats.delivery_rate, 0.0);
        assert_eq!(stats.avg_delivery_latency, 0.0);
    }
}
