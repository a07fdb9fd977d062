//! Notification sink for EcoSmart.
//!
//! Anomalies and degraded agents are turned into [`Message`]s and
//! broadcast to every registered [`MessageChannel`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ecosmart_core::EventBus;
//! use ecosmart_messages::{ChannelRegistry, ConsoleChannel, NotificationBridge};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::new();
//!     let channels = Arc::new(ChannelRegistry::new());
//!     channels.register(Arc::new(ConsoleChannel::new("console"))).await;
//!
//!     let _handles = NotificationBridge::new(channels).attach(&bus);
//! }
//! ```

pub mod bridge;
pub mod channels;
pub mod error;
pub mod message;

pub use bridge::NotificationBridge;
pub use channels::{ChannelRegistry, ChannelStats, ConsoleChannel, MemoryChannel, MessageChannel};
pub use error::{Error, Result};
pub use message::{Message, MessageCategory, MessageId, MessageSeverity};
