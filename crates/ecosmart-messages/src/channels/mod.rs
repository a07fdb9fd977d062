//! Notification channels for sending messages.

pub mod console;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{Error, Message, MessageSeverity, Result};

pub use console::ConsoleChannel;
pub use memory::MemoryChannel;

/// Trait for message channels.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &str;

    /// Get the channel type.
    fn channel_type(&self) -> &str;

    /// Check if the channel is enabled.
    fn is_enabled(&self) -> bool;

    /// Lowest severity this channel forwards.
    fn min_severity(&self) -> MessageSeverity {
        MessageSeverity::Info
    }

    /// Send a message through this channel.
    async fn send(&self, message: &Message) -> Result<()>;
}

/// Channel registry for managing notification channels.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<dyn MessageChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a channel instance.
    pub async fn register(&self, channel: Arc<dyn MessageChannel>) {
        let name = channel.name().to_string();
        self.channels.write().await.insert(name, channel);
    }

    /// Unregister a channel by name.
    pub async fn unregister(&self, name: &str) -> bool {
        self.channels.write().await.remove(name).is_some()
    }

    /// Get a channel by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn MessageChannel>> {
        self.channels.read().await.get(name).cloned()
    }

    /// List all channel names.
    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    /// Get channel statistics.
    pub async fn get_stats(&self) -> ChannelStats {
        let channels = self.channels.read().await;
        let mut by_type = HashMap::new();
        let mut enabled = 0;

        for channel in channels.values() {
            *by_type.entry(channel.channel_type().to_string()).or_insert(0) += 1;
            if channel.is_enabled() {
                enabled += 1;
            }
        }

        ChannelStats {
            total: channels.len(),
            enabled,
            disabled: channels.len() - enabled,
            by_type,
        }
    }

    /// Send `message` to one named channel.
    pub async fn send_to(&self, name: &str, message: &Message) -> Result<()> {
        let channel = self
            .get(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("Channel not found: {}", name)))?;
        channel.send(message).await
    }

    /// Send `message` to every enabled channel whose threshold it meets.
    ///
    /// Failures are logged per channel and do not stop delivery to the
    /// others. Returns the number of channels that accepted the message.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let channels: Vec<Arc<dyn MessageChannel>> =
            self.channels.read().await.values().cloned().collect();
        let mut delivered = 0;
        for channel in channels {
            if !channel.is_enabled() || message.severity < channel.min_severity() {
                continue;
            }
            match channel.send(message).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    channel = %channel.name(),
                    error = %e,
                    "notification delivery failed"
                ),
            }
        }
        delivered
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Total number of channels
    pub total: usize,
    /// Number of enabled channels
    pub enabled: usize,
    /// Number of disabled channels
    pub disabled: usize,
    /// Channels grouped by type
    pub by_type: HashMap<String, usize>,
}
