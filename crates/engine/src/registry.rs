//! Connection registry: user id to the set of live connection handles held
//! by this process.
//!
//! Each connection is represented by the sending half of a bounded channel;
//! the connection's own task drains the receiving half into its socket. A
//! multicast never awaits a slow socket: a full or closed channel only affects
//! that one connection.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use beacon_common::error::AppError;

use crate::gateway::{Gateway, ServerMessage};

/// Frames buffered per connection before new frames are dropped.
pub const CONNECTION_BUFFER: usize = 64;

/// Outcome of fanning a frame out to one user's connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    groups: DashMap<i64, HashMap<String, mpsc::Sender<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to the user's group and return the receiver its
    /// writer task should drain.
    pub fn register(&self, user_id: i64, connection_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        self.groups
            .entry(user_id)
            .or_default()
            .insert(connection_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, user_id: i64, connection_id: &str) {
        if let Some(mut group) = self.groups.get_mut(&user_id) {
            group.remove(connection_id);
        }
        self.groups.remove_if(&user_id, |_, group| group.is_empty());
    }

    /// Connections this process holds for the user.
    pub fn local_connections(&self, user_id: i64) -> usize {
        self.groups.get(&user_id).map(|g| g.len()).unwrap_or(0)
    }

    /// Connections this process holds across all users.
    pub fn total_connections(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    /// Best-effort delivery of a text frame to every local connection of a user.
    pub fn fan_out(&self, user_id: i64, frame: &str) -> FanOut {
        let mut result = FanOut::default();
        let Some(group) = self.groups.get(&user_id) else {
            return result;
        };

        for (connection_id, tx) in group.iter() {
            match tx.try_send(frame.to_string()) {
                Ok(()) => result.delivered += 1,
                Err(e) => {
                    result.dropped += 1;
                    tracing::warn!(
                        user_id,
                        connection_id = %connection_id,
                        error = %e,
                        "Dropped frame for connection"
                    );
                }
            }
        }

        result
    }
}

/// In-process gateway: reaches only connections held by this process.
#[async_trait]
impl Gateway for ConnectionRegistry {
    async fn send(&self, user_id: i64, message: &ServerMessage) -> Result<(), AppError> {
        let frame = serde_json::to_string(message)?;
        let fan_out = self.fan_out(user_id, &frame);
        tracing::debug!(
            user_id,
            delivered = fan_out.delivered,
            dropped = fan_out.dropped,
            "Fanned out frame"
        );
        Ok(())
    }
}
