//! Daily sweeps and the pending-notifications gauge.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use tokio::sync::watch;

use beacon_common::metrics::MetricsSink;
use beacon_engine::email::EmailSender;
use beacon_engine::repository::NotificationRepository;
use beacon_engine::sweeps::{cleanup_read_notifications, send_digests};

/// How often the pending gauge is refreshed.
pub const PENDING_GAUGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    Cleanup,
    Digest,
}

impl Sweep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sweep::Cleanup => "cleanup",
            Sweep::Digest => "digest",
        }
    }
}

/// The first instant strictly after `now` at `hour:00` UTC.
pub fn next_run_at(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(at));
    if today > now {
        return today;
    }
    today
        .checked_add_days(Days::new(1))
        .unwrap_or(today + chrono::Duration::days(1))
}

pub struct SweepRunner {
    repository: Arc<dyn NotificationRepository>,
    email: Arc<dyn EmailSender>,
}

impl SweepRunner {
    pub fn new(repository: Arc<dyn NotificationRepository>, email: Arc<dyn EmailSender>) -> Self {
        Self { repository, email }
    }

    pub async fn run(&self, sweep: Sweep, now: DateTime<Utc>) {
        match sweep {
            Sweep::Cleanup => {
                if let Err(e) = cleanup_read_notifications(self.repository.as_ref(), now).await {
                    tracing::error!(sweep = sweep.as_str(), error = %e, "Sweep failed");
                }
            }
            Sweep::Digest => {
                if let Err(e) =
                    send_digests(self.repository.as_ref(), self.email.as_ref(), now).await
                {
                    tracing::error!(sweep = sweep.as_str(), error = %e, "Sweep failed");
                }
            }
        }
    }
}

/// Run `sweep` every day at `hour` UTC until shutdown.
pub async fn run_daily(
    runner: Arc<SweepRunner>,
    sweep: Sweep,
    hour: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let now = Utc::now();
        let next = next_run_at(now, hour);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tracing::info!(sweep = sweep.as_str(), next_run = %next, "Sweep scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                runner.run(sweep, Utc::now()).await;
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!(sweep = sweep.as_str(), "Sweep scheduler stopped");
}

/// Refresh the `pending_notifications` gauge once.
pub async fn refresh_pending_gauge(
    repository: &dyn NotificationRepository,
    metrics: &dyn MetricsSink,
) {
    match repository.count_pending().await {
        Ok(count) => metrics.set_pending_notifications(count.max(0) as u64),
        Err(e) => tracing::warn!(error = %e, "Failed to count pending notifications"),
    }
}

pub async fn run_pending_gauge(
    repository: Arc<dyn NotificationRepository>,
    metrics: Arc<dyn MetricsSink>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                refresh_pending_gauge(repository.as_ref(), metrics.as_ref()).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_common::types::{NotificationStatus, Priority};
    use beacon_engine::testing::{
        MemoryNotificationRepository, RecordingEmailSender, RecordingMetrics, sample_new,
    };

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_next_run_later_today() {
        assert_eq!(
            next_run_at(at("2026-03-10T01:30:00Z"), 2),
            at("2026-03-10T02:00:00Z")
        );
    }

    #[test]
    fn test_next_run_rolls_to_tomorrow() {
        assert_eq!(
            next_run_at(at("2026-03-10T08:00:00Z"), 8),
            at("2026-03-11T08:00:00Z")
        );
        assert_eq!(
            next_run_at(at("2026-12-31T23:59:59Z"), 2),
            at("2027-01-01T02:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_pending_gauge_reflects_repository() {
        let repository = MemoryNotificationRepository::new();
        repository.ensure_user(1).await;
        repository.insert(&sample_new(1, Priority::High)).await.unwrap();
        let second = repository.insert(&sample_new(1, Priority::Low)).await.unwrap();
        repository
            .mark_delivered(second.id, Utc::now())
            .await
            .unwrap();

        let metrics = RecordingMetrics::new();
        refresh_pending_gauge(&repository, &metrics).await;
        assert_eq!(metrics.pending(), 1);
    }

    #[tokio::test]
    async fn test_digest_sweep_emails_unread_users() {
        let repository = Arc::new(MemoryNotificationRepository::new());
        repository
            .add_user(1, "alice", Some("alice@example.com"))
            .await;
        let created = repository.insert(&sample_new(1, Priority::Medium)).await.unwrap();
        assert_eq!(created.status, NotificationStatus::Pending);

        let email = Arc::new(RecordingEmailSender::new());
        let runner = SweepRunner::new(repository, email.clone());
        runner.run(Sweep::Digest, Utc::now()).await;

        let sent = email.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "alice@example.com");
        assert_eq!(sent[0].subject, "Daily Notification Digest - 1 unread");
    }
}
