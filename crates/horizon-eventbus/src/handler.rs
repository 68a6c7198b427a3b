//! Event handler trait.

use crate::envelope::EventEnvelope;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for handling envelopes delivered by the bus.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Stable name of the handler.
    ///
    /// Used to detect duplicate registrations in a group and to name the
    /// private consumer group of an observer.
    fn handler_type(&self) -> &str;

    /// Handle an envelope.
    ///
    /// Errors are reported on the bus error channel. They do not stop
    /// delivery to other handlers and do not cause redelivery.
    async fn handle_event(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F, Fut> {
    handler_type: String,
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as an [`EventHandler`].
///
/// The closure receives an owned clone of the envelope.
///
/// ```rust
/// use horizon_eventbus::{handler_fn, EventHandler};
///
/// let handler = handler_fn("audit-log", |envelope| async move {
///     println!("{} {}", envelope.event_type(), envelope.aggregate_id());
///     Ok(())
/// });
/// assert_eq!(handler.handler_type(), "audit-log");
/// ```
pub fn handler_fn<F, Fut>(handler_type: impl Into<String>, f: F) -> FnHandler<F, Fut>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        handler_type: handler_type.into(),
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handler_type(&self) -> &str {
        &self.handler_type
    }

    async fn handle_event(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        (self.f)(envelope.clone()).await
    }
}
