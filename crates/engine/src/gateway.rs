//! Fan-out gateway: multicast of server frames to every connection of a user.
//!
//! Two transports implement [`Gateway`]:
//! - [`ConnectionRegistry`] reaches the connections held by this process
//! - [`RedisGateway`] publishes on the `notifications:{user_id}` channel so
//!   that whichever API process holds the user's sockets relays the frame
//!   (see [`relay_channel_layer`])
//!
//! A send only fails when the transport cannot reach the group at all.
//! Per-connection outcomes never surface to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use beacon_common::error::AppError;
use beacon_common::types::Notification;

use crate::registry::ConnectionRegistry;

const CHANNEL_PREFIX: &str = "notifications:";
const CHANNEL_PATTERN: &str = "notifications:*";
const RELAY_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Server -> client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Notification { notification: Notification },
    MissedNotifications { notifications: Vec<Notification> },
    Pong,
}

/// Client -> server frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Multicast `message` to every live connection of `user_id`.
    async fn send(&self, user_id: i64, message: &ServerMessage) -> Result<(), AppError>;
}

fn user_channel(user_id: i64) -> String {
    format!("{}{}", CHANNEL_PREFIX, user_id)
}

fn parse_user_channel(channel: &str) -> Option<i64> {
    channel.strip_prefix(CHANNEL_PREFIX)?.parse().ok()
}

/// Cross-process gateway over Redis pub/sub.
#[derive(Clone)]
pub struct RedisGateway {
    redis: ConnectionManager,
}

impl RedisGateway {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl Gateway for RedisGateway {
    async fn send(&self, user_id: i64, message: &ServerMessage) -> Result<(), AppError> {
        let frame = serde_json::to_string(message)?;
        let mut conn = self.redis.clone();
        let receivers: i64 = conn
            .publish(user_channel(user_id), frame)
            .await
            .map_err(|e| AppError::Gateway(format!("channel layer unreachable: {}", e)))?;

        tracing::debug!(user_id, receivers, "Published frame to channel layer");
        Ok(())
    }
}

/// Relay frames published on the channel layer into the local registry.
///
/// Runs until `shutdown` flips, resubscribing after connection loss.
pub async fn relay_channel_layer(
    client: redis::Client,
    registry: Arc<ConnectionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = relay_once(&client, &registry) => match result {
                Ok(()) => tracing::warn!("Channel layer subscription ended, resubscribing"),
                Err(e) => tracing::error!(error = %e, "Channel layer subscription failed"),
            },
            _ = shutdown.changed() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(RELAY_RECONNECT_DELAY) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("Channel layer relay stopped");
}

async fn relay_once(client: &redis::Client, registry: &ConnectionRegistry) -> Result<(), AppError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(CHANNEL_PATTERN).await?;
    tracing::info!(pattern = CHANNEL_PATTERN, "Subscribed to channel layer");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let Some(user_id) = parse_user_channel(msg.get_channel_name()) else {
            continue;
        };
        let frame: String = match msg.get_payload() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Unreadable channel layer payload");
                continue;
            }
        };
        registry.fan_out(user_id, &frame);
    }

    Ok(())
}
