//! Forwards bus events to notification channels.
//!
//! Anomalies become warnings or critical alerts depending on their
//! severity. An agent entering `Degraded` raises a critical alert, and
//! its recovery an informational one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ecosmart_core::{
    AgentState, Anomaly, AnomalySeverity, EcoEvent, Envelope, EventBus, EventHandler,
    HealthStatus, SubscriptionHandle, Topic,
};
use tokio::sync::Mutex;

use crate::{ChannelRegistry, Message, MessageSeverity};

/// Subscribes to anomaly and health topics and notifies every channel.
#[derive(Clone)]
pub struct NotificationBridge {
    channels: Arc<ChannelRegistry>,
    last_state: Arc<Mutex<HashMap<String, AgentState>>>,
}

impl NotificationBridge {
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        Self {
            channels,
            last_state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn attach(&self, bus: &EventBus) -> Vec<SubscriptionHandle> {
        vec![
            bus.subscribe(Topic::Anomaly, self.clone()),
            bus.subscribe(Topic::Health, self.clone()),
        ]
    }

    /// Translate an event into a notification, if it warrants one.
    pub async fn to_message(&self, event: &EcoEvent) -> Option<Message> {
        match event {
            EcoEvent::Anomaly(anomaly) => Some(anomaly_message(anomaly)),
            EcoEvent::HealthStatus(status) => {
                let previous = self
                    .last_state
                    .lock()
                    .await
                    .insert(status.agent.clone(), status.state);
                health_message(status, previous)
            }
            _ => None,
        }
    }
}

fn anomaly_message(anomaly: &Anomaly) -> Message {
    let severity = match anomaly.severity {
        AnomalySeverity::High => MessageSeverity::Critical,
        AnomalySeverity::Medium => MessageSeverity::Warning,
    };
    let text = format!(
        "{} drew {:.0} W against a baseline of {:.0} W ({:.0}% deviation)",
        anomaly.device_id,
        anomaly.observed_watts,
        anomaly.baseline_watts,
        anomaly.variance_ratio * 100.0
    );
    let metadata = serde_json::to_value(anomaly).unwrap_or(serde_json::Value::Null);
    Message::anomaly(severity, "Consumption anomaly", text, &anomaly.device_id)
        .with_metadata(metadata)
}

fn health_message(status: &HealthStatus, previous: Option<AgentState>) -> Option<Message> {
    match (previous, status.state) {
        (Some(AgentState::Degraded), AgentState::Degraded) => None,
        (_, AgentState::Degraded) => {
            let reason = status.last_error.as_deref().unwrap_or("unknown error");
            Some(Message::health(
                MessageSeverity::Critical,
                "Agent degraded",
                format!(
                    "{} failed {} consecutive ticks: {}",
                    status.agent, status.consecutive_failures, reason
                ),
                &status.agent,
            ))
        }
        (Some(AgentState::Degraded), AgentState::Running) => Some(Message::health(
            MessageSeverity::Info,
            "Agent recovered",
            format!("{} is running again", status.agent),
            &status.agent,
        )),
        _ => None,
    }
}

#[async_trait]
impl EventHandler for NotificationBridge {
    async fn handle(&self, envelope: Arc<Envelope>) -> ecosmart_core::Result<()> {
        if let Some(message) = self.to_message(&envelope.event).await {
            let delivered = self.channels.broadcast(&message).await;
            tracing::debug!(
                category = %message.category,
                source = %message.source,
                delivered,
                "notification dispatched"
            );
        }
        Ok(())
    }
}
