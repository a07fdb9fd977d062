//! In-process publish/subscribe broker.
//!
//! The event bus is the only structure shared between agents. Publishing
//! validates the message, wraps it in an immutable [`Envelope`] and pushes it
//! onto every current subscriber's queue. Each subscription drains its own
//! queue on a dedicated task, so:
//! - a slow or failing handler never blocks the publisher or other handlers
//! - one handler is never invoked concurrently with itself
//! - a subscriber sees messages of a topic in publish order

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::event::{EcoEvent, Envelope, EventMetadata, Topic};

/// Handler invoked for each delivered envelope.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<()> {
        (self.f)(envelope).await
    }
}

/// Returned by [`EventBus::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: Topic,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

/// Snapshot of broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub subscriptions: usize,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Arc<Envelope>>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    subscriptions: AtomicUsize,
}

/// Event bus for EcoSmart.
///
/// Cloning is cheap; clones share the same topics and subscribers.
#[derive(Clone)]
pub struct EventBus {
    // One list per topic. The lock is held for the whole fan-out so that
    // concurrent publishers are serialized per topic.
    topics: Arc<[Mutex<Vec<Subscriber>>; 8]>,
    next_id: Arc<AtomicU64>,
    counters: Arc<Counters>,
    name: Arc<str>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_name("default")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            topics: Arc::new(std::array::from_fn(|_| Mutex::new(Vec::new()))),
            next_id: Arc::new(AtomicU64::new(1)),
            counters: Arc::new(Counters::default()),
            name: Arc::from(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish an event with default metadata.
    ///
    /// Fails only when the event does not belong to `topic` or its payload is
    /// malformed. Otherwise returns immediately after queueing.
    pub fn publish(&self, topic: Topic, event: EcoEvent) -> Result<Arc<Envelope>> {
        self.publish_with_metadata(topic, event, EventMetadata::new("system"))
    }

    /// Publish an event with a custom source.
    pub fn publish_with_source(
        &self,
        topic: Topic,
        event: EcoEvent,
        source: impl Into<String>,
    ) -> Result<Arc<Envelope>> {
        self.publish_with_metadata(topic, event, EventMetadata::new(source))
    }

    /// Publish on the event's own topic.
    pub fn emit(&self, event: EcoEvent, source: impl Into<String>) -> Result<Arc<Envelope>> {
        let topic = event.topic();
        self.publish_with_source(topic, event, source)
    }

    /// Publish an event with custom metadata.
    pub fn publish_with_metadata(
        &self,
        topic: Topic,
        event: EcoEvent,
        metadata: EventMetadata,
    ) -> Result<Arc<Envelope>> {
        if event.topic() != topic {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Bus(format!(
                "{} cannot be published on topic {}",
                event.type_name(),
                topic
            )));
        }
        if let Err(e) = event.validate() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let envelope = Arc::new(Envelope {
            topic,
            event,
            metadata,
        });

        let subscribers = self.topics[topic.index()].lock();
        for subscriber in subscribers.iter() {
            // A closed queue means the worker is gone; unsubscribe cleans up.
            let _ = subscriber.tx.send(envelope.clone());
        }
        drop(subscribers);

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            bus = %self.name,
            topic = %topic,
            event_id = %envelope.metadata.event_id,
            "published"
        );
        Ok(envelope)
    }

    /// Register `handler` for `topic`.
    ///
    /// Only messages published after this call are delivered. Must be called
    /// from within a Tokio runtime.
    pub fn subscribe<H>(&self, topic: Topic, handler: H) -> SubscriptionHandle
    where
        H: EventHandler,
    {
        self.subscribe_arc(topic, Arc::new(handler))
    }

    pub fn subscribe_arc(
        &self,
        topic: Topic,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Envelope>>();
        let counters = self.counters.clone();
        let bus_name = self.name.clone();

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let outcome = AssertUnwindSafe(handler.handle(envelope.clone()))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            bus = %bus_name,
                            subscription = id,
                            topic = %envelope.topic,
                            error = %e,
                            "event handler failed"
                        );
                    }
                    Err(_) => {
                        counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            bus = %bus_name,
                            subscription = id,
                            topic = %envelope.topic,
                            "event handler panicked"
                        );
                    }
                }
            }
            tracing::debug!(bus = %bus_name, subscription = id, "subscription closed");
        });

        self.topics[topic.index()].lock().push(Subscriber { id, tx });
        self.counters.subscriptions.fetch_add(1, Ordering::Relaxed);
        SubscriptionHandle { id, topic }
    }

    /// Remove a subscription. Messages already queued for it are still
    /// delivered; nothing published afterwards is.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscribers = self.topics[handle.topic.index()].lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != handle.id);
        let removed = subscribers.len() != before;
        if removed {
            self.counters.subscriptions.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Subscribe with a queue instead of a handler.
    pub fn receiver(&self, topic: Topic) -> (SubscriptionHandle, EventBusReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(
            topic,
            handler_fn(move |envelope: Arc<Envelope>| {
                let tx = tx.clone();
                async move {
                    tx.send(envelope)
                        .map_err(|_| Error::Bus("receiver dropped".to_string()))
                }
            }),
        );
        (handle, EventBusReceiver { rx })
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics[topic.index()].lock().len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            subscriptions: self.counters.subscriptions.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue-backed subscription created by [`EventBus::receiver`].
pub struct EventBusReceiver {
    rx: mpsc::UnboundedReceiver<Arc<Envelope>>,
}

impl EventBusReceiver {
    /// Receive the next envelope. Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        self.rx.try_recv().ok()
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentState, HealthStatus};
    use chrono::Utc;

    fn health(agent: &str) -> EcoEvent {
        EcoEvent::HealthStatus(HealthStatus {
            agent: agent.to_string(),
            state: AgentState::Running,
            consecutive_failures: 0,
            last_error: None,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let (_handle, mut rx) = bus.receiver(Topic::Health);

        bus.publish(Topic::Health, health("monitor")).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event.type_name(), "HealthStatus");
        assert_eq!(received.topic, Topic::Health);
    }

    #[tokio::test]
    async fn test_topic_mismatch_rejected() {
        let bus = EventBus::new();
        let result = bus.publish(Topic::Decision, health("monitor"));
        assert!(matches!(result, Err(Error::Bus(_))));
        assert_eq!(bus.stats().rejected, 1);
        assert_eq!(bus.stats().published, 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = EventBus::new();
        assert!(bus.emit(health("weather"), "weather").is_ok());
        assert_eq!(bus.stats().published, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let (handle, _rx) = bus.receiver(Topic::Health);
        assert_eq!(bus.subscriber_count(Topic::Health), 1);
        assert!(bus.unsubscribe(&handle));
        assert!(!bus.unsubscribe(&handle));
        assert_eq!(bus.subscriber_count(Topic::Health), 0);
        assert_eq!(bus.stats().subscriptions, 0);
    }
}
