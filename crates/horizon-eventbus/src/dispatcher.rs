//! Routes decoded envelopes to matching handlers.

use crate::envelope::EventEnvelope;
use crate::error::BusError;
use crate::handler::EventHandler;
use crate::matcher::Matcher;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// One (matcher, handler) pair.
pub(crate) struct Registration {
    matcher: Matcher,
    handler: Arc<dyn EventHandler>,
}

impl Registration {
    pub(crate) fn new(matcher: Matcher, handler: Arc<dyn EventHandler>) -> Self {
        Self { matcher, handler }
    }

    pub(crate) fn handler_type(&self) -> &str {
        self.handler.handler_type()
    }
}

/// Append-only registration set of one subscription.
///
/// Dispatch works on a snapshot taken per message, so registrations added
/// while a message is in flight apply from the next message on.
#[derive(Default)]
pub(crate) struct Dispatcher {
    registrations: RwLock<Vec<Arc<Registration>>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a registration, rejecting a second handler with the same type.
    pub(crate) fn register(&self, group: &str, registration: Registration) -> Result<(), BusError> {
        let mut registrations = self.registrations.write();

        if registrations
            .iter()
            .any(|r| r.handler_type() == registration.handler_type())
        {
            return Err(BusError::HandlerAlreadyAdded {
                handler: registration.handler_type().to_string(),
                group: group.to_string(),
            });
        }

        registrations.push(Arc::new(registration));
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.registrations.read().len()
    }

    /// Invoke every matching handler in registration order.
    ///
    /// A failing handler does not stop the others. Returns the failures.
    pub(crate) async fn dispatch(&self, envelope: &EventEnvelope) -> Vec<BusError> {
        let snapshot: Vec<Arc<Registration>> = self.registrations.read().clone();
        let mut failures = Vec::new();
        let mut matched = 0usize;

        for registration in snapshot.iter().filter(|r| r.matcher.matches(envelope)) {
            matched += 1;

            if let Err(e) = registration.handler.handle_event(envelope).await {
                warn!(
                    handler = %registration.handler_type(),
                    event_type = %envelope.event_type(),
                    aggregate_id = %envelope.aggregate_id(),
                    error = %e,
                    "Handler failed"
                );
                failures.push(BusError::HandlerFailed {
                    handler: registration.handler_type().to_string(),
                    cause: e.to_string(),
                });
            }
        }

        debug!(
            event_type = %envelope.event_type(),
            matched,
            failed = failures.len(),
            "Envelope dispatched"
        );

        failures
    }
}
