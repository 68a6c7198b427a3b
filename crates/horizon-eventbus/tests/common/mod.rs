//! Shared helpers for bus integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use horizon_eventbus::{
    BusOptions, EventBus, EventEnvelope, EventHandler, HandlerError, InMemoryBroker,
    SubscriptionState,
};
use parking_lot::Mutex;
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize logging for tests (once).
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

/// Options tuned for fast tests.
pub fn test_options() -> BusOptions {
    BusOptions {
        poll_timeout: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(2),
        error_capacity: 1024,
        ..BusOptions::default()
    }
}

pub async fn bus(broker: &InMemoryBroker, application_id: &str) -> EventBus {
    bus_with(broker, application_id, test_options()).await
}

pub async fn bus_with(
    broker: &InMemoryBroker,
    application_id: &str,
    options: BusOptions,
) -> EventBus {
    EventBus::with_transport(Arc::new(broker.clone()), application_id, options)
        .await
        .expect("bus construction")
}

pub fn envelope(aggregate_id: &str, version: u64) -> EventEnvelope {
    EventEnvelope::new(
        "Created",
        "Order",
        aggregate_id,
        version,
        format!("{{\"n\":{version}}}"),
    )
    .expect("valid envelope")
}

/// Handler that records every envelope it sees.
#[derive(Clone)]
pub struct Recorder {
    handler_type: String,
    seen: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl Recorder {
    pub fn new(handler_type: &str) -> Self {
        Self {
            handler_type: handler_type.to_string(),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, envelope: &EventEnvelope) {
        self.seen.lock().push(envelope.clone());
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn envelopes(&self) -> Vec<EventEnvelope> {
        self.seen.lock().clone()
    }

    /// `(aggregate_id, version)` pairs in arrival order.
    pub fn keys(&self) -> Vec<(String, u64)> {
        self.seen
            .lock()
            .iter()
            .map(|e| (e.aggregate_id().to_string(), e.version()))
            .collect()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    fn handler_type(&self) -> &str {
        &self.handler_type
    }

    async fn handle_event(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.record(envelope);
        Ok(())
    }
}

/// Handler that always fails.
pub struct Failing(pub &'static str);

#[async_trait]
impl EventHandler for Failing {
    fn handler_type(&self) -> &str {
        self.0
    }

    async fn handle_event(&self, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
        Err(format!("{} refused the event", self.0).into())
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until every subscription of `bus` has joined its group.
pub async fn wait_consuming(bus: &EventBus) {
    let joined = wait_until(Duration::from_secs(5), || {
        bus.subscriptions()
            .iter()
            .all(|s| s.state == SubscriptionState::Consuming)
    })
    .await;
    assert!(joined, "subscriptions did not start: {:?}", bus.subscriptions());
}
