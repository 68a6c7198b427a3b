//! Event publisher.

use crate::envelope::EventEnvelope;
use crate::error::BusError;
use crate::transport::{DeliveryReceipt, MessageProducer, OutboundMessage};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, instrument};

/// Topic shared by every bus built with `application_id`.
pub fn topic_name(application_id: &str) -> String {
    format!("{application_id}_events")
}

/// Consumer group for group-mode handlers registered under `group_id`.
pub fn group_name(application_id: &str, group_id: &str) -> String {
    format!("{application_id}_{group_id}")
}

/// Private consumer group for one observer registration.
pub fn observer_group_name(application_id: &str, handler_type: &str) -> String {
    format!(
        "{application_id}_{handler_type}_{}",
        uuid::Uuid::new_v4().simple()
    )
}

/// Publishes envelopes to the application topic.
pub(crate) struct Publisher {
    producer: Box<dyn MessageProducer>,
    topic: String,
}

impl Publisher {
    pub(crate) fn new(producer: Box<dyn MessageProducer>, topic: String) -> Self {
        Self { producer, topic }
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish an envelope keyed by its aggregate id.
    ///
    /// Returns once the broker has acknowledged the message.
    #[instrument(skip(self, envelope), fields(
        topic = %self.topic,
        event_type = %envelope.event_type(),
        aggregate_id = %envelope.aggregate_id(),
        version = envelope.version()
    ))]
    pub(crate) async fn publish(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<DeliveryReceipt, BusError> {
        let payload = envelope.encode();

        debug!(payload_size = payload.len(), "Publishing event");

        let message = OutboundMessage {
            topic: self.topic.clone(),
            key: Bytes::copy_from_slice(envelope.partition_key()),
            payload,
            headers: vec![
                (
                    "event_type".to_string(),
                    Bytes::copy_from_slice(envelope.event_type().as_bytes()),
                ),
                (
                    "aggregate_type".to_string(),
                    Bytes::copy_from_slice(envelope.aggregate_type().as_bytes()),
                ),
            ],
        };

        let receipt = self.producer.send(message).await?;

        debug!(
            partition = receipt.partition,
            offset = receipt.offset,
            "Event published successfully"
        );

        Ok(receipt)
    }

    pub(crate) async fn flush(&self, timeout: Duration) -> Result<(), BusError> {
        self.producer.flush(timeout).await
    }
}
