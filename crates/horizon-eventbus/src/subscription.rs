//! Consumer group subscriptions.
//!
//! A subscription owns one consumer group session and one background
//! consume loop. Group-mode handlers share a subscription per group id;
//! every observer gets a subscription of its own with a private group.
//!
//! The loop moves through [`SubscriptionState`]:
//!
//! ```text
//! Idle -> Joining -> Consuming <-> Rebalancing
//!                        |
//!                        v
//!                     Closing -> Closed
//! ```
//!
//! Offsets are committed only after the dispatcher has returned, so a
//! loop stopped between delivery and commit leaves the message to be
//! redelivered to the group.

use crate::dispatcher::Dispatcher;
use crate::envelope::EventEnvelope;
use crate::error::{BusError, DecodeError, DeliveryFault};
use crate::transport::{ConsumerSpec, InboundMessage, MessageConsumer, Transport};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const JOIN_ATTEMPTS: u32 = 5;
const INITIAL_JOIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_JOIN_BACKOFF: Duration = Duration::from_secs(5);

/// How a subscription divides messages among consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Competing consumers: each message goes to one member of the group.
    Group,
    /// Observer: a private group, so the handler sees every message.
    Broadcast,
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Joining,
    Consuming,
    Rebalancing,
    Closing,
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Consuming => "consuming",
            Self::Rebalancing => "rebalancing",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Broker consumer group name.
    pub group_id: String,
    pub mode: SubscriptionMode,
    pub state: SubscriptionState,
    /// Number of handlers registered on the subscription.
    pub handlers: usize,
}

/// Shared between the bus and the consume loop.
pub(crate) struct Subscription {
    group_id: String,
    mode: SubscriptionMode,
    dispatcher: Dispatcher,
    state: Mutex<SubscriptionState>,
}

impl Subscription {
    pub(crate) fn new(group_id: String, mode: SubscriptionMode) -> Self {
        Self {
            group_id,
            mode,
            dispatcher: Dispatcher::new(),
            state: Mutex::new(SubscriptionState::Idle),
        }
    }

    pub(crate) fn group_id(&self) -> &str {
        &self.group_id
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: SubscriptionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            debug!(
                group_id = %self.group_id,
                from = %previous,
                to = %next,
                "Subscription state changed"
            );
        }
    }

    pub(crate) fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            group_id: self.group_id.clone(),
            mode: self.mode,
            state: self.state(),
            handlers: self.dispatcher.len(),
        }
    }
}

/// Sending side of the bus error channel.
#[derive(Clone)]
pub(crate) struct FaultSink {
    sender: broadcast::Sender<DeliveryFault>,
}

impl FaultSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DeliveryFault> {
        self.sender.subscribe()
    }

    pub(crate) fn report(&self, fault: DeliveryFault) {
        if let Err(broadcast::error::SendError(fault)) = self.sender.send(fault) {
            warn!(fault = %fault, "Delivery fault with no error receiver");
        }
    }
}

/// Background task driving one subscription.
pub(crate) struct ConsumeLoop {
    pub(crate) subscription: Arc<Subscription>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) spec: ConsumerSpec,
    pub(crate) poll_timeout: Duration,
    pub(crate) faults: FaultSink,
    pub(crate) cancel: CancellationToken,
}

impl ConsumeLoop {
    #[instrument(name = "consume_loop", skip(self), fields(
        topic = %self.spec.topic,
        group_id = %self.spec.group_id,
        mode = ?self.subscription.mode
    ))]
    pub(crate) async fn run(self) {
        self.subscription.set_state(SubscriptionState::Joining);

        let Some(mut consumer) = self.join().await else {
            self.subscription.set_state(SubscriptionState::Closed);
            return;
        };

        self.subscription.set_state(SubscriptionState::Consuming);
        info!("Subscription started");

        let mut generation = consumer.assignment_generation();

        loop {
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                polled = consumer.poll(self.poll_timeout) => polled,
            };

            let current = consumer.assignment_generation();
            if current != generation {
                self.subscription.set_state(SubscriptionState::Rebalancing);
                debug!(generation = current, "Partition assignment changed");
                generation = current;
                self.subscription.set_state(SubscriptionState::Consuming);
            }

            match polled {
                Ok(Some(message)) => self.process(consumer.as_mut(), message).await,
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    self.faults
                        .report(DeliveryFault::new(&self.spec.group_id, e));

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_timeout) => {}
                    }
                }
            }
        }

        self.subscription.set_state(SubscriptionState::Closing);
        consumer.close().await;
        self.subscription.set_state(SubscriptionState::Closed);
        info!("Subscription closed");
    }

    /// Join the group, retrying with exponential backoff.
    async fn join(&self) -> Option<Box<dyn MessageConsumer>> {
        let mut backoff = INITIAL_JOIN_BACKOFF;

        for attempt in 1..=JOIN_ATTEMPTS {
            match self.transport.consumer(&self.spec) {
                Ok(consumer) => return Some(consumer),
                Err(e) if attempt == JOIN_ATTEMPTS => {
                    error!(attempt, error = %e, "Giving up joining consumer group");
                    self.faults
                        .report(DeliveryFault::new(&self.spec.group_id, e));
                }
                Err(e) => {
                    warn!(attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "Join failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_JOIN_BACKOFF);
                }
            }
        }

        None
    }

    /// Decode, dispatch, then commit one message.
    async fn process(&self, consumer: &mut dyn MessageConsumer, message: InboundMessage) {
        match decode(&message) {
            Ok(envelope) => {
                debug!(
                    partition = message.partition,
                    offset = message.offset,
                    event_type = %envelope.event_type(),
                    aggregate_id = %envelope.aggregate_id(),
                    "Received message"
                );

                for failure in self.subscription.dispatcher().dispatch(&envelope).await {
                    self.faults.report(
                        DeliveryFault::new(&self.spec.group_id, failure)
                            .with_envelope(envelope.clone()),
                    );
                }
            }
            Err(e) => {
                error!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Skipping undecodable message"
                );
                self.faults
                    .report(DeliveryFault::new(&self.spec.group_id, e));
            }
        }

        if let Err(e) = consumer.commit(&message) {
            warn!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Offset commit failed, message may be redelivered"
            );
            self.faults
                .report(DeliveryFault::new(&self.spec.group_id, e));
        }
    }
}

fn decode(message: &InboundMessage) -> Result<EventEnvelope, BusError> {
    let payload = message.payload.as_ref().ok_or(DecodeError::MissingPayload)?;
    Ok(EventEnvelope::decode(payload)?)
}
