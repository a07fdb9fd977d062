//! Outbound record sink.
//!
//! The storage layer lives outside the core. It receives every persistable
//! record through a [`RecordSink`] attached to the bus.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::event::{Envelope, Topic};
use crate::eventbus::{EventBus, EventHandler, SubscriptionHandle};

/// Topics whose records are handed to the sink.
pub const PERSISTED_TOPICS: [Topic; 6] = [
    Topic::Consumption,
    Topic::Anomaly,
    Topic::Weather,
    Topic::Forecast,
    Topic::Decision,
    Topic::Execution,
];

/// Trait for record persistence.
///
/// Implementations can store records to disk, a database or an external
/// service.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    async fn store(&self, envelope: &Envelope) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Default)]
pub struct NoOpSink;

#[async_trait]
impl RecordSink for NoOpSink {
    async fn store(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

/// Keeps records in memory, for tests and the CLI summary.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Arc<Envelope>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Arc<Envelope>> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, topic: Topic) -> Vec<Arc<Envelope>> {
        self.records
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn store(&self, envelope: &Envelope) -> Result<()> {
        self.records.lock().push(Arc::new(envelope.clone()));
        Ok(())
    }
}

struct SinkHandler<S> {
    sink: Arc<S>,
}

#[async_trait]
impl<S: RecordSink> EventHandler for SinkHandler<S> {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<()> {
        self.sink.store(&envelope).await
    }
}

/// Subscribe `sink` to every persisted topic.
pub fn attach_sink<S: RecordSink>(bus: &EventBus, sink: Arc<S>) -> Vec<SubscriptionHandle> {
    PERSISTED_TOPICS
        .iter()
        .map(|topic| {
            bus.subscribe(
                *topic,
                SinkHandler {
                    sink: sink.clone(),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentState, EcoEvent, HealthStatus, WeatherSnapshot, WeatherSource};
    use crate::model::Generation;
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_sink_receives_persisted_topics_only() {
        let bus = EventBus::new();
        let sink = Arc::new(MemorySink::new());
        let handles = attach_sink(&bus, sink.clone());
        assert_eq!(handles.len(), PERSISTED_TOPICS.len());

        bus.emit(
            EcoEvent::WeatherSnapshot(WeatherSnapshot {
                generation: Generation(1),
                observed_at: Utc::now(),
                temperature_c: 26.0,
                humidity_pct: 55.0,
                solar_potential: 0.8,
                source: WeatherSource::Simulated,
                stale: false,
            }),
            "test",
        )
        .unwrap();
        bus.emit(
            EcoEvent::HealthStatus(HealthStatus {
                agent: "monitor".to_string(),
                state: AgentState::Running,
                consecutive_failures: 0,
                last_error: None,
                timestamp: Utc::now(),
            }),
            "test",
        )
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while sink.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records_for(Topic::Weather).len(), 1);
        assert!(sink.records_for(Topic::Health).is_empty());
    }
}
