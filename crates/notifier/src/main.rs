use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use beacon_common::config::AppConfig;
use beacon_common::db::{create_pool, run_migrations};
use beacon_common::metrics::{MetricsSink, PrometheusMetrics, install_prometheus_exporter};
use beacon_common::redis_pool::create_redis_pool;
use beacon_engine::delivery::DeliveryOrchestrator;
use beacon_engine::gateway::RedisGateway;
use beacon_engine::presence::RedisPresenceStore;
use beacon_engine::repository::{NotificationRepository, PgNotificationRepository};
use beacon_engine::retry::{RedisJobQueue, RetryScheduler};
use beacon_notifier::email::email_sender_from_config;
use beacon_notifier::schedule::{
    PENDING_GAUGE_INTERVAL, Sweep, SweepRunner, run_daily, run_pending_gauge,
};
use beacon_notifier::worker::spawn_retry_workers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_notifier=info,beacon_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Beacon notifier starting...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let (_, redis) = create_redis_pool(&config.redis_url).await?;

    install_prometheus_exporter(SocketAddr::from(([0, 0, 0, 0], config.metrics_port)))?;
    let metrics: Arc<dyn MetricsSink> = Arc::new(PrometheusMetrics);

    let repository: Arc<dyn NotificationRepository> =
        Arc::new(PgNotificationRepository::new(pool));
    let email = email_sender_from_config(&config)?;

    // Retries publish through Redis so whichever API process holds the
    // user's sockets relays the frame.
    let orchestrator = Arc::new(
        DeliveryOrchestrator::new(
            Arc::new(RedisPresenceStore::with_limits(
                redis.clone(),
                Duration::from_secs(config.presence_ttl_secs),
                config.max_connections_per_user,
            )),
            Arc::new(RedisGateway::new(redis.clone())),
            repository.clone(),
            Arc::new(RedisJobQueue::new(redis)),
            metrics.clone(),
        )
        .with_send_timeout(Duration::from_millis(config.gateway_send_timeout_ms)),
    );
    let scheduler = Arc::new(RetryScheduler::new(orchestrator, email.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = spawn_retry_workers(
        config.retry_workers,
        scheduler,
        Duration::from_millis(config.retry_poll_interval_ms),
        shutdown_rx.clone(),
    );
    tracing::info!(workers = config.retry_workers, "Retry workers started");

    let runner = Arc::new(SweepRunner::new(repository.clone(), email));
    tasks.push(tokio::spawn(run_daily(
        runner.clone(),
        Sweep::Cleanup,
        config.cleanup_hour_utc,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_daily(
        runner,
        Sweep::Digest,
        config.digest_hour_utc,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_pending_gauge(
        repository,
        metrics,
        PENDING_GAUGE_INTERVAL,
        shutdown_rx,
    )));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Notifier task failed");
        }
    }

    tracing::info!("Beacon notifier stopped.");
    Ok(())
}
