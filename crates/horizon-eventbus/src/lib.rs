//! # horizon-eventbus
//!
//! Kafka event bus for event-sourced services.
//!
//! Publishes domain events to one topic per application and delivers them,
//! at least once, to registered handlers.
//!
//! ## Features
//!
//! - **Per-aggregate ordering**: events are keyed by aggregate id, so one
//!   aggregate's events stay on one partition and arrive in order
//! - **Group delivery**: handlers registered under the same group on
//!   several buses compete, and each event is handled by one of them
//! - **Observers**: every observer has a private consumer group and sees
//!   every event
//! - **Error channel**: undecodable messages, handler failures and broker
//!   errors from background loops are reported, never swallowed
//! - **In-memory broker**: the same semantics in process, for tests
//!
//! ## Cargo Features
//!
//! - `kafka`: Enable the Kafka transport (requires librdkafka)
//! - `kafka-static`: Build librdkafka from source (requires cmake)
//! - `integration`: Enable integration tests against a live broker
//!
//! ## Example
//!
//! ```rust,ignore
//! use horizon_eventbus::{handler_fn, EventBus, EventEnvelope, KafkaConfig, Matcher};
//!
//! let bus = EventBus::new(KafkaConfig::new("localhost:9092"), "orders").await?;
//! bus.wait_until_ready(Duration::from_secs(30)).await?;
//!
//! bus.add_handler(
//!     Matcher::events(["OrderCreated"]),
//!     handler_fn("order-projection", |envelope| async move {
//!         println!("{} v{}", envelope.aggregate_id(), envelope.version());
//!         Ok(())
//!     }),
//! )
//! .await?;
//!
//! let envelope = EventEnvelope::new("OrderCreated", "Order", "a1", 1, payload)?;
//! bus.publish(&envelope).await?;
//!
//! bus.close().await?;
//! ```

// Core modules (always available)
pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod handler;
pub mod health;
pub mod matcher;
pub mod publisher;
pub mod subscription;
pub mod transport;

mod dispatcher;

// Re-exports for convenience
pub use bus::EventBus;
pub use config::{BusOptions, KafkaConfig, KafkaConfigBuilder, StartOffset};
pub use envelope::EventEnvelope;
pub use error::{BusError, DecodeError, DeliveryFault};
pub use event::Event;
pub use handler::{handler_fn, EventHandler, HandlerError};
pub use health::HealthStatus;
pub use matcher::Matcher;
pub use subscription::{SubscriptionInfo, SubscriptionMode, SubscriptionState};
pub use transport::memory::InMemoryBroker;
pub use transport::{DeliveryReceipt, Transport};

#[cfg(feature = "kafka")]
pub use transport::kafka::KafkaTransport;
