//! Console notification channel.
//!
//! Writes notifications to the log at a level matching their severity.

use async_trait::async_trait;

use super::MessageChannel;
use crate::{Error, Message, MessageSeverity, Result};

/// Console channel backed by `tracing`.
#[derive(Debug, Clone)]
pub struct ConsoleChannel {
    name: String,
    enabled: bool,
    include_details: bool,
}

impl ConsoleChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            include_details: true,
        }
    }

    pub fn with_details(mut self, include: bool) -> Self {
        self.include_details = include;
        self
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }
}

#[async_trait]
impl MessageChannel for ConsoleChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_type(&self) -> &str {
        "console"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if !self.enabled {
            return Err(Error::ChannelDisabled(self.name.clone()));
        }

        let details = if self.include_details {
            message
                .metadata
                .as_ref()
                .filter(|m| !m.is_null())
                .map(|m| m.to_string())
                .unwrap_or_default()
        } else {
            String::new()
        };

        match message.severity {
            MessageSeverity::Info => tracing::info!(
                category = %message.category,
                source = %message.source,
                details = %details,
                "{}: {}",
                message.title,
                message.message
            ),
            MessageSeverity::Warning => tracing::warn!(
                category = %message.category,
                source = %message.source,
                details = %details,
                "{}: {}",
                message.title,
                message.message
            ),
            MessageSeverity::Critical => tracing::error!(
                category = %message.category,
                source = %message.source,
                details = %details,
                "{}: {}",
                message.title,
                message.message
            ),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_console_channel() {
        let channel = ConsoleChannel::new("test");
        let msg = Message::health(
            MessageSeverity::Critical,
            "Agent degraded",
            "weather failed 3 times",
            "weather",
        );
        // Should not panic
        channel.send(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_console_channel_disabled() {
        let mut channel = ConsoleChannel::new("test").with_details(false);
        channel.disable();

        let msg = Message::system("Test", "Test message");
        let result = channel.send(&msg).await;
        assert!(matches!(result, Err(Error::ChannelDisabled(_))));
    }
}
