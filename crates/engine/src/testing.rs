//! In-process collaborators for tests: a memory repository, recording
//! metrics/email sinks, a scriptable gateway and a fully wired [`Harness`].
//!
//! Compiled for this crate's tests and, through the `testing` feature, for
//! the API and notifier test suites.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use beacon_common::error::AppError;
use beacon_common::metrics::MetricsSink;
use beacon_common::types::{
    ChannelType, Notification, NotificationStats, NotificationStatus, Priority, User,
};

use crate::delivery::DeliveryOrchestrator;
use crate::email::EmailSender;
use crate::gateway::{Gateway, ServerMessage};
use crate::presence::MemoryPresenceStore;
use crate::repository::{
    DigestCandidate, NewNotification, NotificationFilter, NotificationRepository,
    NotificationUpdate, PAGE_SIZE, Page,
};
use crate::retry::{JobQueue, MemoryJobQueue, RetryJob, RetryScheduler};
use crate::service::NotificationService;

pub fn sample_new(user_id: i64, priority: Priority) -> NewNotification {
    NewNotification {
        user_id,
        title: "Sample".to_string(),
        message: "Sample message".to_string(),
        priority,
        channel: ChannelType::Websocket,
        data: serde_json::json!({}),
    }
}

#[derive(Default)]
struct RepoState {
    next_id: i64,
    rows: BTreeMap<i64, Notification>,
    users: HashMap<i64, User>,
}

/// Memory-backed [`NotificationRepository`] with the same conditional
/// transitions as the PostgreSQL one.
#[derive(Default)]
pub struct MemoryNotificationRepository {
    state: Mutex<RepoState>,
    mark_failed_down: AtomicBool,
}

impl MemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `mark_failed` return a database error until switched back.
    pub fn set_mark_failed_down(&self, down: bool) {
        self.mark_failed_down.store(down, Ordering::SeqCst);
    }

    /// Insert or replace a user.
    pub async fn add_user(&self, id: i64, username: &str, email: Option<&str>) {
        self.state.lock().await.users.insert(
            id,
            User {
                id,
                username: username.to_string(),
                email: email.map(str::to_string),
                created_at: Utc::now(),
            },
        );
    }

    /// Insert a user with a default address unless one already exists.
    pub async fn ensure_user(&self, id: i64) {
        let mut state = self.state.lock().await;
        state.users.entry(id).or_insert_with(|| User {
            id,
            username: format!("user{}", id),
            email: Some(format!("user{}@example.com", id)),
            created_at: Utc::now(),
        });
    }

    pub async fn insert_at(&self, new: NewNotification, created_at: DateTime<Utc>) -> Notification {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let notification = Notification {
            id: state.next_id,
            user_id: new.user_id,
            title: new.title,
            message: new.message,
            priority: new.priority,
            status: NotificationStatus::Pending,
            channel: new.channel,
            created_at,
            delivered_at: None,
            read_at: None,
            delivery_attempts: 0,
            last_attempt_at: None,
            failure_reason: None,
            data: new.data,
        };
        state.rows.insert(notification.id, notification.clone());
        notification
    }

    async fn filtered(&self, filter: &NotificationFilter) -> Vec<Notification> {
        let state = self.state.lock().await;
        let mut rows: Vec<Notification> = state
            .rows
            .values()
            .filter(|n| filter.status.is_none_or(|s| n.status == s))
            .filter(|n| filter.priority.is_none_or(|p| n.priority == p))
            .filter(|n| filter.user_id.is_none_or(|u| n.user_id == u))
            .filter(|n| filter.date_from.is_none_or(|from| n.created_at >= from))
            .filter(|n| filter.date_to.is_none_or(|to| n.created_at <= to))
            .cloned()
            .collect();
        sort_newest_first(&mut rows);
        rows
    }

    async fn modify<F>(&self, id: i64, f: F) -> Option<Notification>
    where
        F: FnOnce(&mut Notification) -> bool + Send,
    {
        let mut state = self.state.lock().await;
        let row = state.rows.get_mut(&id)?;
        if f(row) { Some(row.clone()) } else { None }
    }
}

fn sort_newest_first(rows: &mut [Notification]) {
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

fn is_unread(n: &Notification) -> bool {
    matches!(
        n.status,
        NotificationStatus::Pending | NotificationStatus::Delivered
    )
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, AppError> {
        Ok(self.insert_at(new.clone(), Utc::now()).await)
    }

    async fn get(&self, id: i64) -> Result<Option<Notification>, AppError> {
        Ok(self.state.lock().await.rows.get(&id).cloned())
    }

    async fn list(
        &self,
        filter: &NotificationFilter,
        page: u32,
    ) -> Result<Page<Notification>, AppError> {
        let page = page.max(1);
        let rows = self.filtered(filter).await;
        let results = rows
            .iter()
            .skip((page as usize - 1) * PAGE_SIZE as usize)
            .take(PAGE_SIZE as usize)
            .cloned()
            .collect();
        Ok(Page {
            count: rows.len() as i64,
            page,
            results,
        })
    }

    async fn update(
        &self,
        id: i64,
        update: &NotificationUpdate,
    ) -> Result<Option<Notification>, AppError> {
        let update = update.clone();
        Ok(self
            .modify(id, move |n| {
                if let Some(title) = update.title {
                    n.title = title;
                }
                if let Some(message) = update.message {
                    n.message = message;
                }
                if let Some(priority) = update.priority {
                    n.priority = priority;
                }
                if let Some(channel) = update.channel {
                    n.channel = channel;
                }
                if let Some(data) = update.data {
                    n.data = data;
                }
                true
            })
            .await)
    }

    async fn delete(&self, id: i64) -> Result<bool, AppError> {
        Ok(self.state.lock().await.rows.remove(&id).is_some())
    }

    async fn mark_delivered(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        Ok(self
            .modify(id, |n| {
                if n.status != NotificationStatus::Pending {
                    return false;
                }
                n.status = NotificationStatus::Delivered;
                n.delivered_at = Some(at);
                true
            })
            .await)
    }

    async fn mark_read(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        Ok(self
            .modify(id, |n| {
                n.status = NotificationStatus::Read;
                n.read_at = Some(at);
                n.delivered_at = n.delivered_at.or(Some(at));
                n.failure_reason = None;
                true
            })
            .await)
    }

    async fn mark_failed(
        &self,
        id: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        if self.mark_failed_down.load(Ordering::SeqCst) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        let reason = reason.to_string();
        Ok(self
            .modify(id, move |n| {
                if n.status != NotificationStatus::Pending {
                    return false;
                }
                n.status = NotificationStatus::Failed;
                n.failure_reason = Some(reason);
                n.last_attempt_at = Some(at);
                true
            })
            .await)
    }

    async fn increment_attempts(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        Ok(self
            .modify(id, |n| {
                n.delivery_attempts += 1;
                n.last_attempt_at = Some(at);
                true
            })
            .await)
    }

    async fn pending_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let filter = NotificationFilter {
            status: Some(NotificationStatus::Pending),
            user_id: Some(user_id),
            ..Default::default()
        };
        let mut rows = self.filtered(&filter).await;
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn count_pending(&self) -> Result<i64, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|n| n.status == NotificationStatus::Pending)
            .count() as i64)
    }

    async fn delete_read_before(
        &self,
        priority: Priority,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state.rows.retain(|_, n| {
            !(n.priority == priority
                && n.status == NotificationStatus::Read
                && n.created_at < cutoff)
        });
        Ok((before - state.rows.len()) as u64)
    }

    async fn digest_candidates(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<DigestCandidate>, AppError> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<i64, i64> = BTreeMap::new();
        for n in state.rows.values() {
            if is_unread(n) && n.created_at >= since {
                *counts.entry(n.user_id).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(user_id, unread)| DigestCandidate { user_id, unread })
            .collect())
    }

    async fn recent_unread(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let filter = NotificationFilter {
            user_id: Some(user_id),
            date_from: Some(since),
            ..Default::default()
        };
        let mut rows: Vec<Notification> = self
            .filtered(&filter)
            .await
            .into_iter()
            .filter(is_unread)
            .collect();
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, AppError> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn stats(&self, filter: &NotificationFilter) -> Result<NotificationStats, AppError> {
        let rows = self.filtered(filter).await;
        let count =
            |status: NotificationStatus| rows.iter().filter(|n| n.status == status).count() as i64;

        let latencies: Vec<f64> = rows
            .iter()
            .filter(|n| {
                matches!(
                    n.status,
                    NotificationStatus::Delivered | NotificationStatus::Read
                )
            })
            .filter_map(Notification::delivery_latency_seconds)
            .collect();
        let avg = (!latencies.is_empty())
            .then(|| latencies.iter().sum::<f64>() / latencies.len() as f64);

        Ok(NotificationStats::from_counts(
            rows.len() as i64,
            count(NotificationStatus::Delivered),
            count(NotificationStatus::Read),
            count(NotificationStatus::Failed),
            count(NotificationStatus::Pending),
            avg,
        ))
    }
}

#[derive(Debug, Default)]
struct MetricsLog {
    created: usize,
    latencies: Vec<f64>,
    failures: Vec<String>,
    active_connections: i64,
    pending: u64,
}

/// [`MetricsSink`] that keeps every observation for assertions.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    log: StdMutex<MetricsLog>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut MetricsLog) -> T) -> T {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut log)
    }

    pub fn created(&self) -> usize {
        self.with_log(|log| log.created)
    }

    pub fn latencies(&self) -> Vec<f64> {
        self.with_log(|log| log.latencies.clone())
    }

    /// `reason` labels of recorded failures.
    pub fn failures(&self) -> Vec<String> {
        self.with_log(|log| log.failures.clone())
    }

    pub fn active_connections(&self) -> i64 {
        self.with_log(|log| log.active_connections)
    }

    pub fn pending(&self) -> u64 {
        self.with_log(|log| log.pending)
    }
}

impl MetricsSink for RecordingMetrics {
    fn notification_created(&self, _priority: Priority, _channel: ChannelType) {
        self.with_log(|log| log.created += 1);
    }

    fn notification_delivered(
        &self,
        _priority: Priority,
        _channel: ChannelType,
        latency_secs: f64,
    ) {
        self.with_log(|log| log.latencies.push(latency_secs));
    }

    fn notification_failed(&self, _priority: Priority, reason: &str) {
        self.with_log(|log| log.failures.push(reason.to_string()));
    }

    fn connection_opened(&self) {
        self.with_log(|log| log.active_connections += 1);
    }

    fn connection_closed(&self) {
        self.with_log(|log| log.active_connections -= 1);
    }

    fn set_pending_notifications(&self, count: u64) {
        self.with_log(|log| log.pending = count);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// [`EmailSender`] that records messages, optionally failing for one address.
#[derive(Debug, Default)]
pub struct RecordingEmailSender {
    sent: StdMutex<Vec<SentEmail>>,
    fail_for: Option<String>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(address: &str) -> Self {
        Self {
            fail_for: Some(address.to_string()),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AppError> {
        if self.fail_for.as_deref() == Some(to) {
            return Err(AppError::Email(format!("mailbox {} unavailable", to)));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentEmail {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatewayMode {
    Accept,
    Fail,
    Stall,
}

/// [`Gateway`] that records accepted frames, or fails or hangs on demand.
#[derive(Debug)]
pub struct ScriptedGateway {
    mode: GatewayMode,
    sent: StdMutex<Vec<(i64, ServerMessage)>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::with_mode(GatewayMode::Accept)
    }

    pub fn failing() -> Self {
        Self::with_mode(GatewayMode::Fail)
    }

    /// Never completes a send; exercises the send timeout.
    pub fn stalled() -> Self {
        Self::with_mode(GatewayMode::Stall)
    }

    fn with_mode(mode: GatewayMode) -> Self {
        Self {
            mode,
            sent: StdMutex::new(Vec::new()),
        }
    }

    pub fn sent_to(&self, user_id: i64) -> Vec<ServerMessage> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn send(&self, user_id: i64, message: &ServerMessage) -> Result<(), AppError> {
        match self.mode {
            GatewayMode::Accept => {
                self.sent
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((user_id, message.clone()));
                Ok(())
            }
            GatewayMode::Fail => Err(AppError::Gateway("scripted failure".into())),
            GatewayMode::Stall => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// The delivery pipeline wired against in-process collaborators.
pub struct Harness {
    pub presence: Arc<MemoryPresenceStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub repository: Arc<MemoryNotificationRepository>,
    pub queue: Arc<MemoryJobQueue>,
    pub metrics: Arc<RecordingMetrics>,
    pub email: Arc<RecordingEmailSender>,
    pub orchestrator: Arc<DeliveryOrchestrator>,
    pub scheduler: Arc<RetryScheduler>,
    pub service: Arc<NotificationService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gateway(Arc::new(ScriptedGateway::new()))
    }

    pub fn with_gateway(gateway: Arc<ScriptedGateway>) -> Self {
        let presence = Arc::new(MemoryPresenceStore::new());
        let repository = Arc::new(MemoryNotificationRepository::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let email = Arc::new(RecordingEmailSender::new());

        let orchestrator = Arc::new(DeliveryOrchestrator::new(
            presence.clone(),
            gateway.clone(),
            repository.clone(),
            queue.clone(),
            metrics.clone(),
        ));
        let scheduler = Arc::new(RetryScheduler::new(orchestrator.clone(), email.clone()));
        let service = Arc::new(NotificationService::new(
            repository.clone(),
            orchestrator.clone(),
            metrics.clone(),
        ));

        Self {
            presence,
            gateway,
            repository,
            queue,
            metrics,
            email,
            orchestrator,
            scheduler,
            service,
        }
    }

    /// Insert a pending medium-priority notification, creating the user with
    /// a default email address if needed.
    pub async fn insert(&self, user_id: i64, title: &str) -> Notification {
        self.repository.ensure_user(user_id).await;
        let mut new = sample_new(user_id, Priority::Medium);
        new.title = title.to_string();
        self.repository.insert_at(new, Utc::now()).await
    }

    /// Take the earliest queued job regardless of its due time, the way a
    /// worker would: the lease is released up front and a follow-up from
    /// `execute` queues it again under the same id.
    pub async fn next_job(&self) -> Option<RetryJob> {
        let job = self
            .queue
            .pop_due(DateTime::<Utc>::MAX_UTC)
            .await
            .unwrap_or(None)?;
        self.queue.complete(&job).await.ok()?;
        Some(job)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
