//! Retry scheduler: durable delayed jobs that re-attempt delivery with
//! backoff and hand off to email once the attempts are used up.
//!
//! Jobs live in a sorted set scored by due time (Unix milliseconds), so any
//! worker in any process can pick up the next due job. Picking a job leases
//! it: the job stays queued, hidden until the lease runs out, and is only
//! removed once its run is finished. A follow-up attempt reuses the job id,
//! so it replaces the leased entry instead of adding a second one, which
//! keeps the attempts of one notification strictly sequential.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{Notification, NotificationStatus};

use crate::delivery::{DeliveryOrchestrator, PushResult};
use crate::email::EmailSender;

/// Delay before attempt `n + 1`, indexed by `min(n - 1, 2)`.
pub const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(900),
];

/// Attempts recorded before the notification is converted to email.
pub const MAX_DELIVERY_ATTEMPTS: i32 = 3;

pub const EMAIL_FALLBACK_REASON: &str = "exceeded max retry attempts, sent via email";

/// `reason` label on `notifications_failed_total` for the email hand-off.
const MAX_RETRIES_LABEL: &str = "max_retries_exceeded";

const RETRY_QUEUE_KEY: &str = "retry_jobs";

/// Hash of job id to serialized job, alongside the sorted set of ids.
const RETRY_PAYLOAD_KEY: &str = "retry_jobs:payload";

/// How long a picked job stays hidden before another worker may pick it up.
pub const DEFAULT_JOB_LEASE: Duration = Duration::from_secs(300);

/// Backoff after `attempts` recorded attempts.
pub fn backoff_delay(attempts: u32) -> Duration {
    let index = (attempts.saturating_sub(1) as usize).min(BACKOFF_SCHEDULE.len() - 1);
    BACKOFF_SCHEDULE[index]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryJob {
    pub id: Uuid,
    pub notification_id: i64,
    /// 1-based attempt number this job performs.
    pub attempt: u32,
    pub delay_secs: u64,
    pub due_at: DateTime<Utc>,
}

impl RetryJob {
    pub fn new(notification_id: i64, attempt: u32, delay: Duration) -> Self {
        Self::with_id(Uuid::new_v4(), notification_id, attempt, delay)
    }

    fn with_id(id: Uuid, notification_id: i64, attempt: u32, delay: Duration) -> Self {
        let delay_secs = delay.as_secs();
        Self {
            id,
            notification_id,
            attempt,
            delay_secs,
            due_at: Utc::now() + chrono::Duration::seconds(delay_secs as i64),
        }
    }

    /// The same job, performing `attempt`, due after `delay`.
    pub fn follow_up(&self, attempt: u32, delay: Duration) -> Self {
        Self::with_id(self.id, self.notification_id, attempt, delay)
    }

    fn score(&self) -> i64 {
        self.due_at.timestamp_millis()
    }
}

fn lease_score(now: DateTime<Utc>, lease: Duration) -> i64 {
    now.timestamp_millis()
        .saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue `job`, replacing any queued job with the same id.
    async fn schedule(&self, job: &RetryJob) -> Result<(), AppError>;

    /// Lease the earliest job due at or before `now`.
    ///
    /// The job stays queued but is not handed out again until its lease
    /// expires, unless it is completed or rescheduled first.
    async fn pop_due(&self, now: DateTime<Utc>) -> Result<Option<RetryJob>, AppError>;

    /// Remove a finished job.
    async fn complete(&self, job: &RetryJob) -> Result<(), AppError>;

    /// Queued jobs, leased ones included.
    async fn len(&self) -> Result<usize, AppError>;
}

/// KEYS[1] = job set, KEYS[2] = payload hash, ARGV[1] = now (ms),
/// ARGV[2] = lease expiry (ms). Leases one due job.
const POP_DUE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
    return false
end
local payload = redis.call('HGET', KEYS[2], ids[1])
if not payload then
    redis.call('ZREM', KEYS[1], ids[1])
    return false
end
redis.call('ZADD', KEYS[1], ARGV[2], ids[1])
return payload
"#;

#[derive(Clone)]
pub struct RedisJobQueue {
    redis: ConnectionManager,
    lease: Duration,
    pop_script: redis::Script,
}

impl RedisJobQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_lease(redis, DEFAULT_JOB_LEASE)
    }

    pub fn with_lease(redis: ConnectionManager, lease: Duration) -> Self {
        Self {
            redis,
            lease,
            pop_script: redis::Script::new(POP_DUE_SCRIPT),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn schedule(&self, job: &RetryJob) -> Result<(), AppError> {
        let payload = serde_json::to_string(job)?;
        let id = job.id.to_string();
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(RETRY_PAYLOAD_KEY, &id, payload)
            .ignore()
            .zadd(RETRY_QUEUE_KEY, &id, job.score())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_due(&self, now: DateTime<Utc>) -> Result<Option<RetryJob>, AppError> {
        let mut conn = self.redis.clone();
        let payload: Option<String> = self
            .pop_script
            .key(RETRY_QUEUE_KEY)
            .key(RETRY_PAYLOAD_KEY)
            .arg(now.timestamp_millis())
            .arg(lease_score(now, self.lease))
            .invoke_async(&mut conn)
            .await?;

        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, job: &RetryJob) -> Result<(), AppError> {
        let id = job.id.to_string();
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(RETRY_QUEUE_KEY, &id)
            .ignore()
            .hdel(RETRY_PAYLOAD_KEY, &id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, AppError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(RETRY_QUEUE_KEY).await?;
        Ok(len)
    }
}

/// In-process queue ordered by due time, with the same lease semantics.
#[derive(Debug)]
pub struct MemoryJobQueue {
    lease: Duration,
    jobs: Mutex<BTreeMap<(i64, Uuid), RetryJob>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_JOB_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease,
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of queued jobs, earliest first.
    pub async fn pending(&self) -> Vec<RetryJob> {
        self.jobs.lock().await.values().cloned().collect()
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn schedule(&self, job: &RetryJob) -> Result<(), AppError> {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|(_, id), _| *id != job.id);
        jobs.insert((job.score(), job.id), job.clone());
        Ok(())
    }

    async fn pop_due(&self, now: DateTime<Utc>) -> Result<Option<RetryJob>, AppError> {
        let mut jobs = self.jobs.lock().await;
        let due = jobs
            .first_key_value()
            .is_some_and(|((score, _), _)| *score <= now.timestamp_millis());
        if !due {
            return Ok(None);
        }
        let Some(((_, id), job)) = jobs.pop_first() else {
            return Ok(None);
        };
        jobs.insert((lease_score(now, self.lease), id), job.clone());
        Ok(Some(job))
    }

    async fn complete(&self, job: &RetryJob) -> Result<(), AppError> {
        self.jobs.lock().await.retain(|(_, id), _| *id != job.id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, AppError> {
        Ok(self.jobs.lock().await.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The notification no longer exists.
    Dropped,
    /// The notification had already left `pending`.
    AlreadyHandled,
    Delivered(Notification),
    Rescheduled { delay: Duration },
    /// Attempts exhausted; marked failed after trying email.
    EmailFallback { email_sent: bool },
}

pub struct RetryScheduler {
    orchestrator: Arc<DeliveryOrchestrator>,
    email: Arc<dyn EmailSender>,
}

impl RetryScheduler {
    pub fn new(orchestrator: Arc<DeliveryOrchestrator>, email: Arc<dyn EmailSender>) -> Self {
        Self {
            orchestrator,
            email,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.orchestrator.queue
    }

    /// Run one retry job to completion.
    ///
    /// A follow-up attempt replaces `job` in the queue under the same id. For
    /// every other outcome the caller completes `job` once this returns.
    pub async fn execute(&self, job: &RetryJob) -> Result<JobOutcome, AppError> {
        let repository = &self.orchestrator.repository;

        let Some(notification) = repository.get(job.notification_id).await? else {
            tracing::warn!(
                notification_id = job.notification_id,
                job_id = %job.id,
                "Notification not found, dropping retry job"
            );
            return Ok(JobOutcome::Dropped);
        };

        if notification.status != NotificationStatus::Pending {
            tracing::debug!(
                notification_id = notification.id,
                status = %notification.status,
                "Notification already handled, skipping retry"
            );
            return Ok(JobOutcome::AlreadyHandled);
        }

        if notification.delivery_attempts >= MAX_DELIVERY_ATTEMPTS {
            return self.email_fallback(&notification).await;
        }

        let Some(notification) = repository
            .increment_attempts(notification.id, Utc::now())
            .await?
        else {
            return Ok(JobOutcome::Dropped);
        };
        let attempts = notification.delivery_attempts.max(0) as u32;

        if self.orchestrator.is_online(notification.user_id).await {
            match self.orchestrator.push(&notification).await? {
                PushResult::Delivered(updated) => return Ok(JobOutcome::Delivered(updated)),
                PushResult::AlreadyHandled => return Ok(JobOutcome::AlreadyHandled),
                PushResult::Failed => {}
            }
        }

        let delay = backoff_delay(attempts);
        self.queue().schedule(&job.follow_up(attempts + 1, delay)).await?;

        tracing::info!(
            notification_id = notification.id,
            attempts,
            delay_secs = delay.as_secs(),
            "Delivery retry rescheduled"
        );

        Ok(JobOutcome::Rescheduled { delay })
    }

    /// Push a job whose execution hit an infrastructure error back by its
    /// backoff, keeping its attempt number. If this fails too, the job's lease
    /// still brings it back.
    pub async fn reschedule_after_error(&self, job: &RetryJob) -> Result<Duration, AppError> {
        let delay = backoff_delay(job.attempt);
        self.queue().schedule(&job.follow_up(job.attempt, delay)).await?;
        Ok(delay)
    }

    /// Mark the notification failed, then email it. The email goes out only
    /// for the run that made the transition, so a rerun never sends twice.
    async fn email_fallback(&self, notification: &Notification) -> Result<JobOutcome, AppError> {
        let repository = &self.orchestrator.repository;
        let recipient = repository
            .get_user(notification.user_id)
            .await?
            .and_then(|user| user.email);

        if repository
            .mark_failed(notification.id, EMAIL_FALLBACK_REASON, Utc::now())
            .await?
            .is_none()
        {
            return Ok(JobOutcome::AlreadyHandled);
        }
        self.orchestrator
            .metrics
            .notification_failed(notification.priority, MAX_RETRIES_LABEL);

        let email_sent = match recipient {
            Some(to) => match self
                .email
                .send(&to, &notification.title, &notification.message)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(
                        notification_id = notification.id,
                        error = %e,
                        "Fallback email failed"
                    );
                    false
                }
            },
            None => {
                tracing::warn!(
                    notification_id = notification.id,
                    user_id = notification.user_id,
                    "No email address for fallback"
                );
                false
            }
        };

        tracing::info!(
            notification_id = notification.id,
            user_id = notification.user_id,
            email_sent,
            "Retries exhausted, notification handed off to email"
        );

        Ok(JobOutcome::EmailFallback { email_sent })
    }
}
