//! Beacon API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use beacon_common::config::AppConfig;
use beacon_common::db::{create_pool, run_migrations};
use beacon_common::metrics::{MetricsSink, PrometheusMetrics, install_prometheus_recorder};
use beacon_common::redis_pool::create_redis_pool;
use beacon_engine::delivery::DeliveryOrchestrator;
use beacon_engine::gateway::{RedisGateway, relay_channel_layer};
use beacon_engine::presence::RedisPresenceStore;
use beacon_engine::rate_limiter::{RateLimiter, RedisRateLimitBackend};
use beacon_engine::registry::ConnectionRegistry;
use beacon_engine::repository::PgNotificationRepository;
use beacon_engine::retry::RedisJobQueue;
use beacon_engine::service::NotificationService;

use beacon_api::routes::create_router;
use beacon_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("beacon_api=debug,beacon_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Beacon API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let (redis_client, redis) = create_redis_pool(&config.redis_url).await?;

    let prometheus = install_prometheus_recorder()?;
    let metrics: Arc<dyn MetricsSink> = Arc::new(PrometheusMetrics);

    // Delivery pipeline
    let presence = Arc::new(RedisPresenceStore::with_limits(
        redis.clone(),
        Duration::from_secs(config.presence_ttl_secs),
        config.max_connections_per_user,
    ));
    let registry = Arc::new(ConnectionRegistry::new());
    let repository = Arc::new(PgNotificationRepository::new(pool));
    let orchestrator = Arc::new(
        DeliveryOrchestrator::new(
            presence.clone(),
            Arc::new(RedisGateway::new(redis.clone())),
            repository.clone(),
            Arc::new(RedisJobQueue::new(redis.clone())),
            metrics.clone(),
        )
        .with_send_timeout(Duration::from_millis(config.gateway_send_timeout_ms)),
    );
    let service = Arc::new(NotificationService::new(
        repository,
        orchestrator,
        metrics.clone(),
    ));
    let rate_limiter = RateLimiter::new(Arc::new(RedisRateLimitBackend::new(redis)));

    // Relay frames published by any process to sockets held here
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = tokio::spawn(relay_channel_layer(
        redis_client,
        registry.clone(),
        shutdown_rx,
    ));

    let port = config.api_port;
    let state = AppState::new(
        config,
        service,
        presence,
        registry,
        rate_limiter,
        metrics,
        prometheus,
    );

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal, stopping gracefully...");
            }
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = relay.await {
        tracing::warn!(error = %e, "Channel layer relay task failed");
    }

    tracing::info!("Beacon API server stopped.");
    Ok(())
}
