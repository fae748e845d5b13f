use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (presence, rate limits, retry queue, channel layer)
    pub redis_url: String,

    /// JWT secret used to validate bearer tokens
    pub jwt_secret: String,

    /// JWT token expiry in hours (used when minting tokens)
    pub jwt_expiry_hours: u64,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the API server listens on (default: 3000)
    pub api_port: u16,

    /// Port the notifier exposes Prometheus metrics on (default: 9000)
    pub metrics_port: u16,

    /// Presence flag and connection-set TTL in seconds (default: 300)
    pub presence_ttl_secs: u64,

    /// Concurrent WebSocket connections allowed per user (default: 5)
    pub max_connections_per_user: usize,

    /// Upper bound on a single gateway multicast in milliseconds (default: 5000)
    pub gateway_send_timeout_ms: u64,

    /// Number of retry workers draining the job queue (default: 4)
    pub retry_workers: usize,

    /// Idle sleep between empty queue polls in milliseconds (default: 1000)
    pub retry_poll_interval_ms: u64,

    /// Hour of day (UTC) the retention cleanup runs (default: 2)
    pub cleanup_hour_utc: u32,

    /// Hour of day (UTC) the digest email runs (default: 8)
    pub digest_hour_utc: u32,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            jwt_expiry_hours: env_or("JWT_EXPIRY_HOURS", 24)?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            api_port: env_or("API_PORT", 3000)?,
            metrics_port: env_or("METRICS_PORT", 9000)?,
            presence_ttl_secs: env_or("PRESENCE_TTL_SECS", 300)?,
            max_connections_per_user: env_or("MAX_CONNECTIONS_PER_USER", 5)?,
            gateway_send_timeout_ms: env_or("GATEWAY_SEND_TIMEOUT_MS", 5000)?,
            retry_workers: env_or("RETRY_WORKERS", 4)?,
            retry_poll_interval_ms: env_or("RETRY_POLL_INTERVAL_MS", 1000)?,
            cleanup_hour_utc: env_or("CLEANUP_HOUR_UTC", 2)?,
            digest_hour_utc: env_or("DIGEST_HOUR_UTC", 8)?,
        };

        if config.cleanup_hour_utc > 23 || config.digest_hour_utc > 23 {
            anyhow::bail!("CLEANUP_HOUR_UTC and DIGEST_HOUR_UTC must be between 0 and 23");
        }
        if config.retry_workers == 0 {
            anyhow::bail!("RETRY_WORKERS must be at least 1");
        }

        Ok(config)
    }
}

/// Read an optional variable, falling back to `default` when unset.
fn env_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
