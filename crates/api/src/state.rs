//! Shared application state for the Axum API server.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use beacon_common::config::AppConfig;
use beacon_common::metrics::MetricsSink;
use beacon_engine::presence::PresenceStore;
use beacon_engine::rate_limiter::RateLimiter;
use beacon_engine::registry::ConnectionRegistry;
use beacon_engine::service::NotificationService;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub service: Arc<NotificationService>,
    pub presence: Arc<dyn PresenceStore>,
    /// Sockets held by this process
    pub registry: Arc<ConnectionRegistry>,
    pub rate_limiter: RateLimiter,
    pub metrics: Arc<dyn MetricsSink>,
    pub prometheus: PrometheusHandle,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        service: Arc<NotificationService>,
        presence: Arc<dyn PresenceStore>,
        registry: Arc<ConnectionRegistry>,
        rate_limiter: RateLimiter,
        metrics: Arc<dyn MetricsSink>,
        prometheus: PrometheusHandle,
    ) -> Self {
        Self {
            config,
            service,
            presence,
            registry,
            rate_limiter,
            metrics,
            prometheus,
        }
    }
}
