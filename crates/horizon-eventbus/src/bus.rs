//! The event bus façade.

use crate::config::BusOptions;
use crate::dispatcher::Registration;
use crate::envelope::EventEnvelope;
use crate::error::{BusError, DeliveryFault};
use crate::event::Event;
use crate::handler::EventHandler;
use crate::health::HealthStatus;
use crate::matcher::Matcher;
use crate::publisher::{group_name, observer_group_name, topic_name, Publisher};
use crate::subscription::{
    ConsumeLoop, FaultSink, Subscription, SubscriptionInfo, SubscriptionMode, SubscriptionState,
};
use crate::transport::{ConsumerSpec, DeliveryReceipt, TopicSpec, Transport};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(feature = "kafka")]
use crate::config::KafkaConfig;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_NAME_LEN: usize = 200;

/// Event bus for one application.
///
/// Buses built with the same application id on the same broker share one
/// topic and form one logical bus, whether they live in one process or in
/// many.
pub struct EventBus {
    application_id: String,
    options: BusOptions,
    transport: Arc<dyn Transport>,
    publisher: Publisher,
    faults: FaultSink,
    cancel: CancellationToken,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    groups: HashMap<String, Arc<Subscription>>,
    subscriptions: Vec<Arc<Subscription>>,
    tasks: Vec<(Arc<Subscription>, JoinHandle<()>)>,
}

impl EventBus {
    /// Connect to Kafka with default options.
    #[cfg(feature = "kafka")]
    pub async fn new(
        config: KafkaConfig,
        application_id: impl Into<String>,
    ) -> Result<Self, BusError> {
        Self::with_kafka(config, application_id, BusOptions::default()).await
    }

    /// Connect to Kafka with explicit options.
    #[cfg(feature = "kafka")]
    pub async fn with_kafka(
        config: KafkaConfig,
        application_id: impl Into<String>,
        options: BusOptions,
    ) -> Result<Self, BusError> {
        let transport = crate::transport::kafka::KafkaTransport::new(config)?;
        Self::with_transport(Arc::new(transport), application_id, options).await
    }

    /// Connect to Kafka using `KAFKA_*` and `HORIZON_BUS_*` environment variables.
    #[cfg(feature = "kafka")]
    pub async fn from_env(application_id: impl Into<String>) -> Result<Self, BusError> {
        Self::with_kafka(KafkaConfig::from_env()?, application_id, BusOptions::from_env()?).await
    }

    /// Build a bus over any transport.
    ///
    /// Creates the application topic if needed and the producer.
    #[instrument(skip(transport, application_id, options), fields(broker = %transport.broker()))]
    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        application_id: impl Into<String>,
        options: BusOptions,
    ) -> Result<Self, BusError> {
        let application_id = application_id.into();
        validate_name(&application_id).map_err(|reason| BusError::ConfigInvalid {
            var: "application_id".to_string(),
            reason,
        })?;
        options.validate()?;

        let topic = topic_name(&application_id);
        transport
            .ensure_topic(&TopicSpec {
                name: topic.clone(),
                partitions: options.partitions,
                replication_factor: options.replication_factor,
            })
            .await?;

        let producer = transport.producer(options.publish_timeout)?;
        let faults = FaultSink::new(options.error_capacity);

        info!(
            application_id = %application_id,
            topic = %topic,
            "Event bus created"
        );

        Ok(Self {
            application_id,
            publisher: Publisher::new(producer, topic),
            transport,
            faults,
            cancel: CancellationToken::new(),
            registry: Mutex::new(Registry::default()),
            options,
        })
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Topic all events of this application go to.
    pub fn topic(&self) -> &str {
        self.publisher.topic()
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    /// Publish an envelope and wait for the broker acknowledgement.
    #[instrument(skip(self, envelope), fields(application_id = %self.application_id))]
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<DeliveryReceipt, BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.publisher.publish(envelope).await
    }

    /// Wrap a typed event in an envelope and publish it.
    pub async fn publish_event<E: Event>(
        &self,
        event: &E,
        aggregate_id: impl Into<String>,
        version: u64,
    ) -> Result<DeliveryReceipt, BusError> {
        let envelope = EventEnvelope::from_event(event, aggregate_id, version)?;
        self.publish(&envelope).await
    }

    /// Register a handler in the default group.
    pub async fn add_handler<H: EventHandler>(
        &self,
        matcher: Matcher,
        handler: H,
    ) -> Result<(), BusError> {
        let group_id = self.options.default_group.clone();
        self.add_handler_in_group(&group_id, matcher, handler).await
    }

    /// Register a handler in a named group.
    ///
    /// Buses sharing the application id and group id compete for messages:
    /// each message reaches one of them. The first handler of a group
    /// starts its consume loop; later ones join the running loop. If the
    /// loop gave up joining the group, the next registration restarts it.
    #[instrument(skip(self, matcher, handler), fields(
        application_id = %self.application_id,
        handler_type = %handler.handler_type()
    ))]
    pub async fn add_handler_in_group<H: EventHandler>(
        &self,
        group_id: &str,
        matcher: Matcher,
        handler: H,
    ) -> Result<(), BusError> {
        if handler.handler_type().is_empty() {
            return Err(BusError::MissingHandlerType);
        }
        validate_name(group_id).map_err(|reason| BusError::InvalidGroupId { reason })?;

        let registration = Registration::new(matcher, Arc::new(handler));
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(BusError::Closed);
        }

        if let Some(subscription) = registry.groups.get(group_id).cloned() {
            subscription
                .dispatcher()
                .register(subscription.group_id(), registration)?;

            if subscription.state() == SubscriptionState::Closed {
                info!(group_id = %subscription.group_id(), "Restarting closed subscription");
                registry
                    .tasks
                    .retain(|(s, _)| !Arc::ptr_eq(s, &subscription));
                self.spawn_loop(&mut registry, subscription);
            } else {
                debug!(group_id = %subscription.group_id(), "Handler added to running group");
            }
            return Ok(());
        }

        let subscription = Arc::new(Subscription::new(
            group_name(&self.application_id, group_id),
            SubscriptionMode::Group,
        ));
        subscription
            .dispatcher()
            .register(subscription.group_id(), registration)?;
        registry
            .groups
            .insert(group_id.to_string(), subscription.clone());
        self.start(&mut registry, subscription);

        Ok(())
    }

    /// Register an observer: a handler that sees every message.
    ///
    /// Each observer consumes through a private group of its own.
    #[instrument(skip(self, matcher, handler), fields(
        application_id = %self.application_id,
        handler_type = %handler.handler_type()
    ))]
    pub async fn add_observer<H: EventHandler>(
        &self,
        matcher: Matcher,
        handler: H,
    ) -> Result<(), BusError> {
        if handler.handler_type().is_empty() {
            return Err(BusError::MissingHandlerType);
        }
        // The handler type becomes part of the observer's group name.
        validate_name(handler.handler_type()).map_err(|reason| BusError::InvalidGroupId {
            reason: format!("observer handler type {reason}"),
        })?;

        let subscription = Arc::new(Subscription::new(
            observer_group_name(&self.application_id, handler.handler_type()),
            SubscriptionMode::Broadcast,
        ));
        let registration = Registration::new(matcher, Arc::new(handler));

        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(BusError::Closed);
        }
        subscription
            .dispatcher()
            .register(subscription.group_id(), registration)?;
        self.start(&mut registry, subscription);

        Ok(())
    }

    fn start(&self, registry: &mut Registry, subscription: Arc<Subscription>) {
        registry.subscriptions.push(subscription.clone());
        self.spawn_loop(registry, subscription);
    }

    fn spawn_loop(&self, registry: &mut Registry, subscription: Arc<Subscription>) {
        subscription.set_state(SubscriptionState::Idle);
        let consume_loop = ConsumeLoop {
            spec: ConsumerSpec {
                topic: self.publisher.topic().to_string(),
                group_id: subscription.group_id().to_string(),
                start_offset: self.options.start_offset,
                session_timeout: self.options.session_timeout,
            },
            subscription: subscription.clone(),
            transport: self.transport.clone(),
            poll_timeout: self.options.poll_timeout,
            faults: self.faults.clone(),
            cancel: self.cancel.child_token(),
        };

        info!(group_id = %subscription.group_id(), "Starting subscription");

        let task = tokio::spawn(consume_loop.run());
        registry.tasks.push((subscription, task));
    }

    /// Receive asynchronous faults: undecodable messages, handler failures
    /// and broker errors raised inside consume loops.
    ///
    /// Every receiver sees every fault sent after it was created. A
    /// receiver that falls more than `error_capacity` faults behind gets
    /// `RecvError::Lagged`.
    pub fn errors(&self) -> broadcast::Receiver<DeliveryFault> {
        self.faults.subscribe()
    }

    /// Snapshot of all subscriptions started by this bus.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry
            .lock()
            .subscriptions
            .iter()
            .map(|s| s.info())
            .collect()
    }

    /// Report broker and topic health.
    pub async fn health_check(&self) -> Result<HealthStatus, BusError> {
        self.transport.health(self.publisher.topic()).await
    }

    /// Wait until the application topic can take traffic.
    ///
    /// Topic creation completes asynchronously on the broker, so a fresh
    /// topic may need a moment before it has partition leaders.
    #[instrument(skip(self), fields(topic = %self.publisher.topic()))]
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<HealthStatus, BusError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.health_check().await {
                Ok(status) if status.is_ready() => {
                    debug!(partitions = status.partitions, "Topic ready");
                    return Ok(status);
                }
                Ok(status) => debug!(partitions = status.partitions, "Topic not ready yet"),
                Err(e) => debug!(error = %e, "Health check failed"),
            }

            if Instant::now() + READY_POLL_INTERVAL > deadline {
                return Err(BusError::ConnectionTimeout);
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Stop every consume loop and flush the producer.
    ///
    /// Waits up to `shutdown_grace` for loops to finish the message in
    /// hand; loops still running after that are aborted without committing.
    /// Calling `close` again returns immediately.
    #[instrument(skip(self), fields(application_id = %self.application_id))]
    pub async fn close(&self) -> Result<(), BusError> {
        let tasks = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return Ok(());
            }
            registry.closed = true;
            std::mem::take(&mut registry.tasks)
        };

        info!(subscriptions = tasks.len(), "Closing event bus");
        self.cancel.cancel();

        let deadline = Instant::now() + self.options.shutdown_grace;
        join_all(
            tasks
                .into_iter()
                .map(|(subscription, task)| stop_within(deadline, subscription, task)),
        )
        .await;

        if let Err(e) = self.publisher.flush(self.options.shutdown_grace).await {
            warn!(error = %e, "Producer flush failed");
        }

        info!("Event bus closed");
        Ok(())
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn stop_within(deadline: Instant, subscription: Arc<Subscription>, mut task: JoinHandle<()>) {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(group_id = %subscription.group_id(), error = %e, "Consume loop failed");
            subscription.set_state(SubscriptionState::Closed);
        }
        Err(_) => {
            error!(
                group_id = %subscription.group_id(),
                "Consume loop did not stop within shutdown grace, aborting"
            );
            task.abort();
            let _ = task.await;
            subscription.set_state(SubscriptionState::Closed);
        }
    }
}

/// Application and group ids end up in topic and group names.
fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("longer than {MAX_NAME_LEN} characters"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(format!("invalid character {c:?}"));
    }
    Ok(())
}
