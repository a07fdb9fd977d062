//! Notification message types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSeverity {
    /// Informational - no action required
    #[default]
    Info,
    /// Warning - potential issue
    Warning,
    /// Critical - action required
    Critical,
}

impl MessageSeverity {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warning" | "warn" => Some(Self::Warning),
            "critical" | "crit" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for MessageSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    /// Consumption anomaly on a device.
    Anomaly,
    /// Agent health changes.
    Health,
    System,
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anomaly => f.write_str("anomaly"),
            Self::Health => f.write_str("health"),
            Self::System => f.write_str("system"),
        }
    }
}

/// A notification about a system event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,
    pub category: MessageCategory,
    pub severity: MessageSeverity,
    pub title: String,
    pub message: String,
    /// Device id or agent name
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// Additional metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Message {
    pub fn new(
        category: MessageCategory,
        severity: MessageSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            category,
            severity,
            title: title.into(),
            message: message.into(),
            source: source.into(),
            timestamp: Utc::now(),
            metadata: None,
            tags: Vec::new(),
        }
    }

    /// Create a device anomaly message.
    pub fn anomaly(
        severity: MessageSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(MessageCategory::Anomaly, severity, title, message, device_id);
        msg.tags.push("device".to_string());
        msg
    }

    /// Create an agent health message.
    pub fn health(
        severity: MessageSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(MessageCategory::Health, severity, title, message, agent);
        msg.tags.push("agent".to_string());
        msg
    }

    /// Create a system message.
    pub fn system(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            MessageCategory::System,
            MessageSeverity::Info,
            title,
            message,
            "system",
        )
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }
}
