//! Scheduled sweeps: retention cleanup of read notifications and the daily
//! unread digest. Both are independent of the delivery pipeline and only
//! touch the repository (plus the email sender for digests).

use chrono::{DateTime, Duration, Utc};

use beacon_common::error::AppError;
use beacon_common::types::{Notification, Priority};

use crate::email::EmailSender;
use crate::priority;
use crate::repository::NotificationRepository;

/// How far back the digest looks for unread notifications.
pub const DIGEST_WINDOW_HOURS: i64 = 24;

/// Notifications listed in one digest email.
pub const DIGEST_MAX_ITEMS: usize = 10;

/// Delete read notifications older than their priority's retention.
pub async fn cleanup_read_notifications(
    repository: &dyn NotificationRepository,
    now: DateTime<Utc>,
) -> Result<u64, AppError> {
    let mut total = 0;
    for priority in Priority::ALL {
        let retention = priority::retention(priority);
        let cutoff = now - Duration::seconds(retention.as_secs() as i64);
        let deleted = repository.delete_read_before(priority, cutoff).await?;
        if deleted > 0 {
            tracing::info!(%priority, deleted, %cutoff, "Deleted expired read notifications");
        }
        total += deleted;
    }

    tracing::info!(total, "Retention cleanup finished");
    Ok(total)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Subject and body of a digest email for `unread` notifications, of which
/// `recent` are the newest few.
pub fn digest_email(unread: i64, recent: &[Notification]) -> (String, String) {
    let subject = format!("Daily Notification Digest - {} unread", unread);

    let mut body = format!("You have {} unread notification(s):\n\n", unread);
    for notification in recent.iter().take(DIGEST_MAX_ITEMS) {
        body.push_str(&format!(
            "- {}: {}\n",
            notification.title, notification.message
        ));
    }

    (subject, body)
}

/// Email every user with unread notifications from the last 24 hours.
///
/// A failure for one user is logged and counted; the sweep carries on.
pub async fn send_digests(
    repository: &dyn NotificationRepository,
    email: &dyn EmailSender,
    now: DateTime<Utc>,
) -> Result<DigestReport, AppError> {
    let since = now - Duration::hours(DIGEST_WINDOW_HOURS);
    let candidates = repository.digest_candidates(since).await?;
    let mut report = DigestReport::default();

    for candidate in candidates {
        match send_digest(repository, email, candidate.user_id, candidate.unread, since).await {
            Ok(true) => report.sent += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => {
                report.failed += 1;
                tracing::error!(user_id = candidate.user_id, error = %e, "Digest failed");
            }
        }
    }

    tracing::info!(
        sent = report.sent,
        skipped = report.skipped,
        failed = report.failed,
        "Digest sweep finished"
    );
    Ok(report)
}

async fn send_digest(
    repository: &dyn NotificationRepository,
    email: &dyn EmailSender,
    user_id: i64,
    unread: i64,
    since: DateTime<Utc>,
) -> Result<bool, AppError> {
    let Some(to) = repository.get_user(user_id).await?.and_then(|u| u.email) else {
        tracing::debug!(user_id, "No email address, skipping digest");
        return Ok(false);
    };

    let recent = repository
        .recent_unread(user_id, since, DIGEST_MAX_ITEMS as i64)
        .await?;
    let (subject, body) = digest_email(unread, &recent);
    email.send(&to, &subject, &body).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use beacon_common::types::NotificationStatus;

    use super::*;
    use crate::testing::{MemoryNotificationRepository, RecordingEmailSender, sample_new};

    #[tokio::test]
    async fn test_cleanup_respects_per_priority_retention() {
        let repo = MemoryNotificationRepository::new();
        let now = Utc::now();

        let old_high = repo.insert_at(sample_new(1, Priority::High), now - Duration::days(2)).await;
        let recent_medium = repo
            .insert_at(sample_new(1, Priority::Medium), now - Duration::days(2))
            .await;
        let old_low_unread = repo
            .insert_at(sample_new(1, Priority::Low), now - Duration::days(40))
            .await;
        let old_low_read = repo
            .insert_at(sample_new(1, Priority::Low), now - Duration::days(40))
            .await;
        for id in [old_high.id, recent_medium.id, old_low_read.id] {
            repo.mark_read(id, now).await.unwrap();
        }

        let deleted = cleanup_read_notifications(&repo, now).await.unwrap();

        assert_eq!(deleted, 2);
        assert!(repo.get(old_high.id).await.unwrap().is_none());
        assert!(repo.get(old_low_read.id).await.unwrap().is_none());
        assert!(repo.get(recent_medium.id).await.unwrap().is_some());
        assert_eq!(
            repo.get(old_low_unread.id).await.unwrap().unwrap().status,
            NotificationStatus::Pending
        );
    }

    #[test]
    fn test_digest_email_format() {
        let (subject, body) = digest_email(2, &[]);
        assert_eq!(subject, "Daily Notification Digest - 2 unread");
        assert!(body.starts_with("You have 2 unread notification(s):"));
    }

    #[tokio::test]
    async fn test_digest_lists_ten_most_recent() {
        let repo = MemoryNotificationRepository::new();
        repo.add_user(1, "alice", Some("alice@example.com")).await;
        let now = Utc::now();
        for i in 0..12 {
            let mut new = sample_new(1, Priority::Medium);
            new.title = format!("T{}", i);
            repo.insert_at(new, now - Duration::minutes(60 - i)).await;
        }
        repo.insert_at(sample_new(1, Priority::Medium), now - Duration::hours(30)).await;

        let email = RecordingEmailSender::new();
        let report = send_digests(&repo, &email, now).await.unwrap();

        assert_eq!(report, DigestReport { sent: 1, skipped: 0, failed: 0 });
        let sent = email.sent();
        assert_eq!(sent[0].to, "alice@example.com");
        assert_eq!(sent[0].subject, "Daily Notification Digest - 12 unread");
        assert_eq!(sent[0].body.lines().filter(|l| l.starts_with("- ")).count(), 10);
        assert!(sent[0].body.contains("- T11: "));
        assert!(!sent[0].body.contains("- T0: "));
    }

    #[tokio::test]
    async fn test_digest_failure_does_not_stop_sweep() {
        let repo = MemoryNotificationRepository::new();
        repo.add_user(1, "alice", Some("alice@example.com")).await;
        repo.add_user(2, "bob", Some("bob@example.com")).await;
        repo.add_user(3, "carol", None).await;
        let now = Utc::now();
        for user in [1, 2, 3] {
            repo.insert_at(sample_new(user, Priority::Low), now - Duration::hours(1)).await;
        }

        let email = RecordingEmailSender::failing_for("alice@example.com");
        let report = send_digests(&repo, &email, now).await.unwrap();

        assert_eq!(report, DigestReport { sent: 1, skipped: 1, failed: 1 });
        assert_eq!(email.sent()[0].to, "bob@example.com");
    }
}
