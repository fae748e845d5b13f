//! Retry worker pool.
//!
//! Each worker leases due jobs from the shared queue and hands them to the
//! scheduler. A job leaves the queue only when its run has finished: a
//! follow-up attempt replaces it, a final outcome completes it, and a run
//! that fails part way leaves the lease to bring it back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use beacon_common::error::AppError;
use beacon_engine::retry::{JobOutcome, RetryScheduler};

/// Lease and run one due job. Returns `false` when nothing was due.
pub async fn run_once(scheduler: &RetryScheduler) -> Result<bool, AppError> {
    let queue = scheduler.queue();
    let Some(job) = queue.pop_due(Utc::now()).await? else {
        return Ok(false);
    };

    match scheduler.execute(&job).await {
        Ok(outcome) => {
            log_outcome(job.notification_id, job.attempt, &outcome);
            if !matches!(outcome, JobOutcome::Rescheduled { .. }) {
                queue.complete(&job).await?;
            }
        }
        Err(e) => {
            tracing::error!(
                notification_id = job.notification_id,
                attempt = job.attempt,
                error = %e,
                "Retry job failed, rescheduling"
            );
            scheduler.reschedule_after_error(&job).await?;
        }
    }

    Ok(true)
}

fn log_outcome(notification_id: i64, attempt: u32, outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Dropped => {
            tracing::debug!(notification_id, attempt, "Notification gone, job dropped")
        }
        JobOutcome::AlreadyHandled => {
            tracing::debug!(notification_id, attempt, "Notification already handled")
        }
        JobOutcome::Delivered(_) => {
            tracing::info!(notification_id, attempt, "Delivered on retry")
        }
        JobOutcome::Rescheduled { delay } => tracing::info!(
            notification_id,
            attempt,
            delay_secs = delay.as_secs(),
            "Delivery retry scheduled"
        ),
        JobOutcome::EmailFallback { email_sent } => tracing::warn!(
            notification_id,
            attempt,
            email_sent,
            "Retries exhausted, fell back to email"
        ),
    }
}

/// Drain the queue until `shutdown` flips to true, sleeping `poll_interval`
/// whenever nothing is due.
pub async fn run_retry_worker(
    worker_id: usize,
    scheduler: Arc<RetryScheduler>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(worker_id, "Retry worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match run_once(&scheduler).await {
            Ok(ran) => !ran,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Retry queue error");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    tracing::info!(worker_id, "Retry worker stopped");
}

/// Spawn `count` workers sharing one scheduler.
pub fn spawn_retry_workers(
    count: usize,
    scheduler: Arc<RetryScheduler>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker_id| {
            tokio::spawn(run_retry_worker(
                worker_id,
                scheduler.clone(),
                poll_interval,
                shutdown.clone(),
            ))
        })
        .collect()
}
