//! Error types for the horizon-eventbus crate.

use crate::envelope::EventEnvelope;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    // Configuration errors (permanent, no retry)
    /// Required configuration variable is missing.
    #[error("Configuration missing: {var}")]
    ConfigMissing { var: String },

    /// Configuration value is invalid.
    #[error("Configuration invalid for {var}: {reason}")]
    ConfigInvalid { var: String, reason: String },

    // Connection errors (transient, retry with backoff)
    /// Failed to connect to the broker or to join a consumer group.
    #[error("Connection to broker {broker} failed: {cause}")]
    ConnectionFailed { broker: String, cause: String },

    /// Connection timed out.
    #[error("Connection timed out")]
    ConnectionTimeout,

    // Publishing errors
    /// Broker rejected the message.
    #[error("Failed to publish to topic {topic}: {cause}")]
    PublishFailed { topic: String, cause: String },

    /// Broker did not acknowledge the message in time.
    #[error("Publish to topic {topic} was not acknowledged in time")]
    PublishTimeout { topic: String },

    // Consuming errors
    /// Failed to fetch from topic.
    #[error("Failed to consume from topic {topic}: {cause}")]
    ConsumeFailed { topic: String, cause: String },

    /// Failed to commit a consumed offset.
    #[error("Failed to commit offset on {topic}/{partition}: {cause}")]
    CommitFailed {
        topic: String,
        partition: i32,
        cause: String,
    },

    // Envelope errors
    /// Envelope cannot be built from the given fields.
    #[error("Invalid event envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// Delivered bytes do not form a valid envelope.
    #[error("Invalid event envelope: {0}")]
    Decode(#[from] DecodeError),

    /// A registered handler failed.
    #[error("Handler {handler} failed: {cause}")]
    HandlerFailed { handler: String, cause: String },

    // Registration errors
    /// Handler registered without a handler type.
    #[error("Missing handler type")]
    MissingHandlerType,

    /// Group identifier is unusable as a consumer group name.
    #[error("Invalid group id: {reason}")]
    InvalidGroupId { reason: String },

    /// Handler type already registered in this group.
    #[error("Handler {handler} already added to group {group}")]
    HandlerAlreadyAdded { handler: String, group: String },

    /// Bus has been closed.
    #[error("Event bus is closed")]
    Closed,

    // Typed payload errors
    /// Failed to serialize a typed event payload.
    #[error("Failed to serialize event type {event_type}: {cause}")]
    SerializationFailed { event_type: String, cause: String },

    /// Failed to deserialize a typed event payload.
    #[error("Failed to deserialize event type {event_type}: {cause}")]
    DeserializationFailed { event_type: String, cause: String },

    // Internal Kafka errors
    /// Internal Kafka client error.
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl BusError {
    /// Returns true if this error is transient and can be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::ConnectionFailed { .. }
                | BusError::ConnectionTimeout
                | BusError::PublishFailed { .. }
                | BusError::PublishTimeout { .. }
                | BusError::ConsumeFailed { .. }
                | BusError::CommitFailed { .. }
        )
    }

    /// Returns true if this is a configuration error.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BusError::ConfigMissing { .. } | BusError::ConfigInvalid { .. }
        )
    }

    /// Returns true if this error comes from a rejected registration.
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            BusError::MissingHandlerType
                | BusError::InvalidGroupId { .. }
                | BusError::HandlerAlreadyAdded { .. }
        )
    }
}

/// Reasons a byte buffer is not a valid envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message has no payload")]
    MissingPayload,

    #[error("truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported envelope format {0}")]
    UnsupportedFormat(u8),

    #[error("unknown flag bits {0:#04x}")]
    UnknownFlags(u8),

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("required field {field} is empty")]
    MissingField { field: &'static str },

    #[error("timestamp out of range")]
    InvalidTimestamp,

    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
}

/// Fault raised inside a background consume loop.
///
/// Faults are reported on the bus error channel, never returned to a caller.
#[derive(Debug, Clone)]
pub struct DeliveryFault {
    /// Consumer group the fault happened in.
    pub subscription: String,
    /// What went wrong.
    pub error: BusError,
    /// The envelope being handled, when one was decoded.
    pub envelope: Option<EventEnvelope>,
}

impl DeliveryFault {
    pub(crate) fn new(subscription: impl Into<String>, error: BusError) -> Self {
        Self {
            subscription: subscription.into(),
            error,
            envelope: None,
        }
    }

    pub(crate) fn with_envelope(mut self, envelope: EventEnvelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    /// Returns true if the fault came from an undecodable message.
    pub fn is_decode(&self) -> bool {
        matches!(self.error, BusError::Decode(_))
    }

    /// Returns true if the fault came from a failing handler.
    pub fn is_handler(&self) -> bool {
        matches!(self.error, BusError::HandlerFailed { .. })
    }
}

impl std::fmt::Display for DeliveryFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.envelope {
            Some(envelope) => write!(
                f,
                "{} ({} {}@{}): {}",
                self.subscription,
                envelope.event_type(),
                envelope.aggregate_id(),
                envelope.version(),
                self.error
            ),
            None => write!(f, "{}: {}", self.subscription, self.error),
        }
    }
}
