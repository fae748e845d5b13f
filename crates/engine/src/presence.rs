//! Presence store: which users are online and which connections they hold.
//!
//! Presence lives in a shared expiring key-value store so that every gateway
//! process sees the same truth:
//! - `user_presence:{user_id}` holds the online flag with a TTL
//! - `user_connections:{user_id}` is the set of live connection ids, same TTL
//!
//! Both keys expire passively when nobody refreshes them, which cleans up after
//! crashed processes without explicit teardown.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tokio::time::Instant;

use beacon_common::error::AppError;

/// Default TTL for the presence flag and connection set (5 minutes).
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(300);

/// Default cap on concurrent connections per user.
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Set the online flag with a fresh TTL. Idempotent.
    async fn mark_online(&self, user_id: i64) -> Result<(), AppError>;

    /// Clear the online flag immediately.
    async fn mark_offline(&self, user_id: i64) -> Result<(), AppError>;

    async fn is_online(&self, user_id: i64) -> Result<bool, AppError>;

    /// Extend the TTL if the user is currently online; never resurrects an
    /// expired session.
    async fn refresh(&self, user_id: i64) -> Result<(), AppError>;

    /// Register a connection unless the user is already at the cap.
    ///
    /// Returns `false` when the cap is reached. The check and the insert are a
    /// single atomic step per user.
    async fn add_connection(&self, user_id: i64, connection_id: &str) -> Result<bool, AppError>;

    async fn remove_connection(&self, user_id: i64, connection_id: &str) -> Result<(), AppError>;

    async fn connection_count(&self, user_id: i64) -> Result<usize, AppError>;

    /// Drop a connection and clear the online flag if it was the last one.
    ///
    /// Removal, count and flag clear are one atomic step, so a concurrent
    /// reconnect either sees the flag cleared before it marks itself online
    /// or keeps the flag set. Returns the connections left.
    async fn release_connection(&self, user_id: i64, connection_id: &str)
    -> Result<usize, AppError>;
}

fn presence_key(user_id: i64) -> String {
    format!("user_presence:{}", user_id)
}

fn connections_key(user_id: i64) -> String {
    format!("user_connections:{}", user_id)
}

/// KEYS[1] = connection set, ARGV = connection id, cap, ttl seconds.
const ADD_CONNECTION_SCRIPT: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[3])
    return 1
end
if redis.call('SCARD', KEYS[1]) >= tonumber(ARGV[2]) then
    return 0
end
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 1
"#;

/// KEYS[1] = connection set, KEYS[2] = presence flag, ARGV[1] = connection id.
const RELEASE_CONNECTION_SCRIPT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
local left = redis.call('SCARD', KEYS[1])
if left == 0 then
    redis.call('DEL', KEYS[2])
end
return left
"#;

/// Redis-backed presence store. Every call is a round trip; nothing is cached.
#[derive(Clone)]
pub struct RedisPresenceStore {
    redis: ConnectionManager,
    ttl: Duration,
    max_connections: usize,
    add_connection_script: redis::Script,
    release_connection_script: redis::Script,
}

impl RedisPresenceStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_limits(redis, DEFAULT_PRESENCE_TTL, DEFAULT_MAX_CONNECTIONS)
    }

    pub fn with_limits(redis: ConnectionManager, ttl: Duration, max_connections: usize) -> Self {
        Self {
            redis,
            ttl,
            max_connections,
            add_connection_script: redis::Script::new(ADD_CONNECTION_SCRIPT),
            release_connection_script: redis::Script::new(RELEASE_CONNECTION_SCRIPT),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn mark_online(&self, user_id: i64) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(presence_key(user_id), "online", self.ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn mark_offline(&self, user_id: i64) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(presence_key(user_id)).await?;
        Ok(())
    }

    async fn is_online(&self, user_id: i64) -> Result<bool, AppError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(presence_key(user_id)).await?;
        Ok(exists)
    }

    async fn refresh(&self, user_id: i64) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        let ttl = self.ttl.as_secs() as i64;
        // EXPIRE is a no-op on a missing key, so an expired flag stays expired.
        let refreshed: bool = conn.expire(presence_key(user_id), ttl).await?;
        if refreshed {
            conn.expire::<_, ()>(connections_key(user_id), ttl).await?;
        }
        Ok(())
    }

    async fn add_connection(&self, user_id: i64, connection_id: &str) -> Result<bool, AppError> {
        let mut conn = self.redis.clone();
        let admitted: i64 = self
            .add_connection_script
            .key(connections_key(user_id))
            .arg(connection_id)
            .arg(self.max_connections)
            .arg(self.ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;

        if admitted == 0 {
            tracing::debug!(
                user_id,
                max_connections = self.max_connections,
                "Connection rejected, per-user cap reached"
            );
        }

        Ok(admitted == 1)
    }

    async fn remove_connection(&self, user_id: i64, connection_id: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.srem::<_, _, ()>(connections_key(user_id), connection_id)
            .await?;
        Ok(())
    }

    async fn connection_count(&self, user_id: i64) -> Result<usize, AppError> {
        let mut conn = self.redis.clone();
        let count: usize = conn.scard(connections_key(user_id)).await?;
        Ok(count)
    }

    async fn release_connection(
        &self,
        user_id: i64,
        connection_id: &str,
    ) -> Result<usize, AppError> {
        let mut conn = self.redis.clone();
        let left: usize = self
            .release_connection_script
            .key(connections_key(user_id))
            .key(presence_key(user_id))
            .arg(connection_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(left)
    }
}

#[derive(Debug, Default)]
struct MemoryPresenceState {
    online_until: HashMap<i64, Instant>,
    connections: HashMap<i64, (HashSet<String>, Instant)>,
}

impl MemoryPresenceState {
    fn purge_expired(&mut self, user_id: i64, now: Instant) {
        if self.online_until.get(&user_id).is_some_and(|until| *until <= now) {
            self.online_until.remove(&user_id);
        }
        if self
            .connections
            .get(&user_id)
            .is_some_and(|(_, until)| *until <= now)
        {
            self.connections.remove(&user_id);
        }
    }
}

/// In-process presence store with the same TTL and cap semantics as
/// [`RedisPresenceStore`]. Only meaningful for a single process.
#[derive(Debug)]
pub struct MemoryPresenceStore {
    ttl: Duration,
    max_connections: usize,
    state: Mutex<MemoryPresenceState>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_PRESENCE_TTL, DEFAULT_MAX_CONNECTIONS)
    }

    pub fn with_limits(ttl: Duration, max_connections: usize) -> Self {
        Self {
            ttl,
            max_connections,
            state: Mutex::new(MemoryPresenceState::default()),
        }
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn mark_online(&self, user_id: i64) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state.online_until.insert(user_id, Instant::now() + self.ttl);
        Ok(())
    }

    async fn mark_offline(&self, user_id: i64) -> Result<(), AppError> {
        self.state.lock().await.online_until.remove(&user_id);
        Ok(())
    }

    async fn is_online(&self, user_id: i64) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        state.purge_expired(user_id, Instant::now());
        Ok(state.online_until.contains_key(&user_id))
    }

    async fn refresh(&self, user_id: i64) -> Result<(), AppError> {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.purge_expired(user_id, now);

        if let Some(until) = state.online_until.get_mut(&user_id) {
            *until = now + self.ttl;
            if let Some((_, conn_until)) = state.connections.get_mut(&user_id) {
                *conn_until = now + self.ttl;
            }
        }
        Ok(())
    }

    async fn add_connection(&self, user_id: i64, connection_id: &str) -> Result<bool, AppError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.purge_expired(user_id, now);

        let (set, until) = state
            .connections
            .entry(user_id)
            .or_insert_with(|| (HashSet::new(), now + self.ttl));

        if !set.contains(connection_id) && set.len() >= self.max_connections {
            return Ok(false);
        }

        set.insert(connection_id.to_string());
        *until = now + self.ttl;
        Ok(true)
    }

    async fn remove_connection(&self, user_id: i64, connection_id: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if let Some((set, _)) = state.connections.get_mut(&user_id) {
            set.remove(connection_id);
            if set.is_empty() {
                state.connections.remove(&user_id);
            }
        }
        Ok(())
    }

    async fn connection_count(&self, user_id: i64) -> Result<usize, AppError> {
        let mut state = self.state.lock().await;
        state.purge_expired(user_id, Instant::now());
        Ok(state
            .connections
            .get(&user_id)
            .map(|(set, _)| set.len())
            .unwrap_or(0))
    }

    async fn release_connection(
        &self,
        user_id: i64,
        connection_id: &str,
    ) -> Result<usize, AppError> {
        let mut state = self.state.lock().await;
        state.purge_expired(user_id, Instant::now());

        let left = match state.connections.get_mut(&user_id) {
            Some((set, _)) => {
                set.remove(connection_id);
                set.len()
            }
            None => 0,
        };
        if left == 0 {
            state.connections.remove(&user_id);
            state.online_until.remove(&user_id);
        }
        Ok(left)
    }
}
