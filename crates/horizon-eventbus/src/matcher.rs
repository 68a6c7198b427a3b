//! Matchers select which handlers receive an envelope.

use crate::envelope::EventEnvelope;
use std::fmt;
use std::sync::Arc;

type PredicateFn = dyn Fn(&EventEnvelope) -> bool + Send + Sync;

/// Predicate over the routing fields of an envelope.
#[derive(Clone)]
pub enum Matcher {
    /// Match every envelope.
    Any,

    /// Match envelopes whose event type is one of the listed types.
    EventTypes(Vec<String>),

    /// Match envelopes whose aggregate type is one of the listed types.
    AggregateTypes(Vec<String>),

    /// Match with an arbitrary predicate.
    Predicate(Arc<PredicateFn>),

    /// All inner matchers must match. Empty matches everything.
    All(Vec<Matcher>),

    /// At least one inner matcher must match. Empty matches nothing.
    AnyOf(Vec<Matcher>),
}

impl Matcher {
    /// Match any of the given event types.
    pub fn events<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Matcher::EventTypes(types.into_iter().map(Into::into).collect())
    }

    /// Match any of the given aggregate types.
    pub fn aggregates<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Matcher::AggregateTypes(types.into_iter().map(Into::into).collect())
    }

    /// Match with a closure.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&EventEnvelope) -> bool + Send + Sync + 'static,
    {
        Matcher::Predicate(Arc::new(f))
    }

    /// Combine with another matcher using AND logic
    #[must_use]
    pub fn and(self, other: Matcher) -> Self {
        match self {
            Matcher::All(mut inner) => {
                inner.push(other);
                Matcher::All(inner)
            }
            this => Matcher::All(vec![this, other]),
        }
    }

    /// Combine with another matcher using OR logic
    #[must_use]
    pub fn or(self, other: Matcher) -> Self {
        match self {
            Matcher::AnyOf(mut inner) => {
                inner.push(other);
                Matcher::AnyOf(inner)
            }
            this => Matcher::AnyOf(vec![this, other]),
        }
    }

    /// Check if the envelope matches.
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::EventTypes(types) => types.iter().any(|t| t == envelope.event_type()),
            Matcher::AggregateTypes(types) => {
                types.iter().any(|t| t == envelope.aggregate_type())
            }
            Matcher::Predicate(f) => f(envelope),
            Matcher::All(inner) => inner.iter().all(|m| m.matches(envelope)),
            Matcher::AnyOf(inner) => inner.iter().any(|m| m.matches(envelope)),
        }
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Matcher::Any
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Any => write!(f, "Any"),
            Matcher::EventTypes(types) => f.debug_tuple("EventTypes").field(types).finish(),
            Matcher::AggregateTypes(types) => {
                f.debug_tuple("AggregateTypes").field(types).finish()
            }
            Matcher::Predicate(_) => write!(f, "Predicate(..)"),
            Matcher::All(inner) => f.debug_tuple("All").field(inner).finish(),
            Matcher::AnyOf(inner) => f.debug_tuple("AnyOf").field(inner).finish(),
        }
    }
}
