//! Broker transport seam.
//!
//! The bus talks to the broker only through these traits. Two
//! implementations ship with the crate:
//!
//! - [`memory::InMemoryBroker`]: in-process partitioned log with consumer
//!   groups, for tests and single-process deployments.
//! - `kafka::KafkaTransport` (feature `kafka`): rdkafka producer, consumer
//!   and admin clients.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use crate::config::StartOffset;
use crate::error::BusError;
use crate::health::HealthStatus;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Topic the bus needs to exist.
#[derive(Debug, Clone)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

/// Consumer group membership the bus asks for.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub topic: String,
    pub group_id: String,
    pub start_offset: StartOffset,
    pub session_timeout: Duration,
}

/// Message handed to the broker.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Bytes,
    pub payload: Bytes,
    pub headers: Vec<(String, Bytes)>,
}

/// Message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
}

/// Where the broker stored a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// Connection to a broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Broker address, for diagnostics.
    fn broker(&self) -> &str;

    /// Create the topic unless it already exists.
    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<(), BusError>;

    /// Create a producer.
    fn producer(&self, publish_timeout: Duration) -> Result<Box<dyn MessageProducer>, BusError>;

    /// Join a consumer group on a topic.
    fn consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn MessageConsumer>, BusError>;

    /// Report broker and topic health.
    async fn health(&self, topic: &str) -> Result<HealthStatus, BusError>;
}

/// Sends messages and waits for the broker acknowledgement.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<DeliveryReceipt, BusError>;

    /// Wait for in-flight messages to be acknowledged.
    async fn flush(&self, timeout: Duration) -> Result<(), BusError>;
}

/// One member of a consumer group.
#[async_trait]
pub trait MessageConsumer: Send {
    /// Wait up to `timeout` for the next message of an assigned partition.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, BusError>;

    /// Mark `message` and everything before it on its partition as processed.
    fn commit(&mut self, message: &InboundMessage) -> Result<(), BusError>;

    /// Number of partition assignment changes observed so far.
    fn assignment_generation(&self) -> u64;

    /// Leave the group.
    async fn close(self: Box<Self>);
}
