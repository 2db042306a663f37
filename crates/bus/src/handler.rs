//! Handler abstractions: the consumer trait, dispatch-time filters, and the
//! typed wrapper.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HandlerResult;
use crate::event::Event;
use crate::types::AggregateId;

/// Dispatch-time filter deciding which events reach a handler.
///
/// Filtering happens in the dispatcher, before `handle()` is invoked — a
/// filtered handler never sees a non-matching event at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventFilter {
    /// Receive every event.
    All,
    /// Receive events of exactly this type.
    Type(String),
    /// Receive events whose type is in this set.
    Types(HashSet<String>),
    /// Receive every event of one aggregate, regardless of type.
    Aggregate(AggregateId),
}

impl EventFilter {
    /// Build a [`EventFilter::Types`] filter from any collection of type
    /// tags.
    pub fn types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Types(types.into_iter().map(Into::into).collect())
    }

    /// Whether this filter admits the given event.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Type(event_type) => event.event_type() == event_type,
            Self::Types(types) => types.contains(event.event_type()),
            Self::Aggregate(aggregate_id) => event.aggregate_id() == aggregate_id,
        }
    }
}

/// A subscribed consumer of events.
///
/// Handlers are opaque to the bus: side effects are entirely handler-defined.
/// A handler signals failure by returning an error from [`handle`], which the
/// dispatcher records against the handler's circuit breaker and, for
/// at-least-once events, turns into a dead-letter entry. Failures never
/// propagate to the publisher or to other handlers of the same event.
///
/// [`handle`]: EventHandler::handle
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Registry key for this handler. Re-subscribing the same name replaces
    /// the prior registration.
    fn name(&self) -> &str;

    /// The dispatch-time filter; defaults to receiving everything.
    fn filter(&self) -> &EventFilter {
        &EventFilter::All
    }

    /// Process one event. May suspend on I/O; suspension stalls only the
    /// event's own aggregate.
    async fn handle(&self, event: &Event) -> HandlerResult;
}

// Shared handlers delegate, so callers can keep a handle to a handler
// they have subscribed.
#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn filter(&self) -> &EventFilter {
        (**self).filter()
    }

    async fn handle(&self, event: &Event) -> HandlerResult {
        (**self).handle(event).await
    }
}

/// Wrapper restricting an inner handler to a fixed set of event types.
///
/// The declared set replaces whatever filter the inner handler reports; the
/// dispatcher's set-membership check guarantees `handle()` is never invoked
/// for a type outside the set.
pub struct TypedEventHandler<H> {
    inner: H,
    filter: EventFilter,
}

impl<H: EventHandler> TypedEventHandler<H> {
    /// Restrict `inner` to the given event types.
    pub fn new<I, S>(inner: H, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner,
            filter: EventFilter::types(types),
        }
    }
}

#[async_trait]
impl<H: EventHandler> EventHandler for TypedEventHandler<H> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn filter(&self) -> &EventFilter {
        &self.filter
    }

    async fn handle(&self, event: &Event) -> HandlerResult {
        self.inner.handle(event).await
    }
}
