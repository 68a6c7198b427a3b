//! Event trait for typed domain events carried as JSON payloads.

use serde::{de::DeserializeOwned, Serialize};

/// Trait for domain events that travel on the bus as JSON payloads.
///
/// The bus itself treats payloads as opaque bytes. This trait is the
/// convenience layer for services that share event types as Rust structs.
///
/// # Example
///
/// ```rust
/// use serde::{Serialize, Deserialize};
/// use horizon_eventbus::Event;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// pub struct OrderCreated {
///     pub customer: String,
/// }
///
/// impl Event for OrderCreated {
///     const EVENT_TYPE: &'static str = "OrderCreated";
///     const AGGREGATE_TYPE: &'static str = "Order";
/// }
/// ```
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Event type name written to the envelope, used by matchers.
    const EVENT_TYPE: &'static str;

    /// Aggregate type that emits this event.
    const AGGREGATE_TYPE: &'static str;
}
