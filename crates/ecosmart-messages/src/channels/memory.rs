//! Memory notification channel (for testing).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::MessageChannel;
use crate::{Error, Message, MessageSeverity, Result};

/// In-memory channel for testing.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    name: String,
    enabled: bool,
    min_severity: MessageSeverity,
    messages: Arc<Mutex<Vec<Message>>>,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            min_severity: MessageSeverity::Info,
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn disabled(name: impl Into<String>) -> Self {
        Self {
            enabled: false,
            ..Self::new(name)
        }
    }

    pub fn with_min_severity(mut self, severity: MessageSeverity) -> Self {
        self.min_severity = severity;
        self
    }

    pub async fn get_messages(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.messages.lock().await.clear();
    }

    pub async fn count(&self) -> usize {
        self.messages.lock().await.len()
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_type(&self) -> &str {
        "memory"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn min_severity(&self) -> MessageSeverity {
        self.min_severity
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if !self.enabled {
            return Err(Error::ChannelDisabled(self.name.clone()));
        }
        self.messages.lock().await.push(message.clone());
        Ok(())
    }
}
