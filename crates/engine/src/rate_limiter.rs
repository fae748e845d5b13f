//! Rate limiter: per-user, per-priority, per-action admission control.
//!
//! Each `(action, priority, user)` triple owns a counter key that expires one
//! window after its first increment. This is a fixed window, not a sliding one:
//! a burst at the end of one window may be followed by a full burst at the
//! start of the next.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use beacon_common::error::AppError;
use beacon_common::types::Priority;

use crate::priority;

/// Counter window shared by every priority.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(3600);

/// Requests allowed per window for a priority level.
pub fn limit_for(priority: Priority) -> u32 {
    match priority {
        Priority::High => 100,
        Priority::Medium => 50,
        Priority::Low => 20,
    }
}

/// Result of a `check_and_consume` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
}

impl RateDecision {
    pub fn denied() -> Self {
        Self {
            allowed: false,
            remaining: 0,
        }
    }
}

/// Storage for windowed counters.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Atomically increment `key` if it is below `limit`. A denied call leaves
    /// the counter untouched.
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, AppError>;

    /// Current count in the window (0 when the key is absent or expired).
    async fn current(&self, key: &str) -> Result<u32, AppError>;
}

/// KEYS[1] = counter, ARGV = limit, window seconds. Returns {allowed, remaining}.
const CHECK_AND_CONSUME_SCRIPT: &str = r#"
local limit = tonumber(ARGV[1])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= limit then
    return {0, 0}
end
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return {1, limit - count}
"#;

#[derive(Clone)]
pub struct RedisRateLimitBackend {
    redis: ConnectionManager,
    script: redis::Script,
}

impl RedisRateLimitBackend {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            script: redis::Script::new(CHECK_AND_CONSUME_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimitBackend {
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, AppError> {
        let mut conn = self.redis.clone();
        let (allowed, remaining): (i64, i64) = self
            .script
            .key(key)
            .arg(limit)
            .arg(window.as_secs())
            .invoke_async(&mut conn)
            .await?;

        Ok(RateDecision {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u32,
        })
    }

    async fn current(&self, key: &str) -> Result<u32, AppError> {
        let mut conn = self.redis.clone();
        let count: Option<u32> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }
}

/// In-process counter store with the same fixed-window semantics.
#[derive(Debug, Default)]
pub struct MemoryRateLimitBackend {
    counters: Mutex<HashMap<String, (u32, Instant)>>,
}

impl MemoryRateLimitBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitBackend for MemoryRateLimitBackend {
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, AppError> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;

        if counters.get(key).is_some_and(|(_, expires)| *expires <= now) {
            counters.remove(key);
        }

        let current = counters.get(key).map(|(count, _)| *count).unwrap_or(0);
        if current >= limit {
            return Ok(RateDecision::denied());
        }

        let entry = counters.entry(key.to_string()).or_insert((0, now + window));
        entry.0 += 1;

        Ok(RateDecision {
            allowed: true,
            remaining: limit - entry.0,
        })
    }

    async fn current(&self, key: &str) -> Result<u32, AppError> {
        let counters = self.counters.lock().await;
        Ok(counters
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(count, _)| *count)
            .unwrap_or(0))
    }
}

/// Priority-aware front end over a [`RateLimitBackend`].
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>) -> Self {
        Self { backend }
    }

    fn key(user_id: i64, priority: Priority, action: &str) -> String {
        format!("rate_limit:{}:{}:{}", action, priority, user_id)
    }

    /// Consume one unit for `(user, priority, action)` if the window allows it.
    ///
    /// Unknown priorities are limited as medium.
    pub async fn check_and_consume(
        &self,
        user_id: i64,
        raw_priority: &str,
        action: &str,
    ) -> Result<RateDecision, AppError> {
        let priority = priority::resolve(raw_priority);
        let limit = limit_for(priority);
        let key = Self::key(user_id, priority, action);

        let decision = self
            .backend
            .check_and_consume(&key, limit, RATE_LIMIT_WINDOW)
            .await?;

        if !decision.allowed {
            tracing::debug!(user_id, %priority, action, limit, "Rate limit exceeded");
        }

        Ok(decision)
    }

    /// Units left in the current window, without consuming one.
    pub async fn remaining(
        &self,
        user_id: i64,
        raw_priority: &str,
        action: &str,
    ) -> Result<u32, AppError> {
        let priority = priority::resolve(raw_priority);
        let limit = limit_for(priority);
        let current = self
            .backend
            .current(&Self::key(user_id, priority, action))
            .await?;
        Ok(limit.saturating_sub(current))
    }
}
