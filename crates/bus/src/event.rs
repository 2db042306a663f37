//! The event value object and its derived metadata projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::{AggregateId, DeliveryMode, EventId, EventPriority};

/// An immutable event flowing through the bus.
///
/// Construction goes through [`Event::builder`] (or [`Event::new`] for bare
/// events) and validates the identity fields; after that the event never
/// changes. Events sharing an [`AggregateId`] are dispatched in publish order
/// relative to each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: EventId,
    event_type: String,
    aggregate_id: AggregateId,
    aggregate_type: String,
    publisher: String,
    data: Value,
    metadata: Value,
    priority: EventPriority,
    delivery_mode: DeliveryMode,
    occurred_at: DateTime<Utc>,
}

/// Canonical form hashed by [`Event::checksum`].
///
/// Content fields only: `event_id` and `occurred_at` are excluded, so two
/// events carrying the same business payload hash identically even though
/// their identities differ. Field order is fixed by this struct and
/// `serde_json` keeps map keys sorted, so serialization is deterministic.
#[derive(Serialize)]
struct ChecksumBody<'a> {
    event_type: &'a str,
    aggregate_id: &'a str,
    aggregate_type: &'a str,
    publisher: &'a str,
    data: &'a Value,
    metadata: &'a Value,
    priority: EventPriority,
    delivery_mode: DeliveryMode,
}

impl Event {
    /// Start building an event of the given type.
    #[must_use]
    pub fn builder(event_type: impl Into<String>) -> EventBuilder {
        EventBuilder::new(event_type)
    }

    /// Create a bare event with an empty payload and default priority and
    /// delivery mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] if any identity field is empty.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<AggregateId>,
        aggregate_type: impl Into<String>,
        publisher: impl Into<String>,
    ) -> Result<Self> {
        Self::builder(event_type)
            .aggregate(aggregate_id, aggregate_type)
            .publisher(publisher)
            .build()
    }

    /// Unique identity of this event.
    #[must_use]
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Semantic kind of the event, used for typed-handler filtering.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The logical stream this event belongs to.
    #[must_use]
    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    /// Category of the aggregate (e.g. `"patient"`).
    #[must_use]
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// Logical name of the producing component.
    #[must_use]
    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    /// Structured payload.
    #[must_use]
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Side-channel metadata (user id, correlation id, ...).
    #[must_use]
    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    /// Relative importance; never reorders within an aggregate.
    #[must_use]
    pub fn priority(&self) -> EventPriority {
        self.priority
    }

    /// What happens to this event when dispatch fails.
    #[must_use]
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// When the event was constructed.
    #[must_use]
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Compute the SHA-256 content checksum (64 lowercase hex characters).
    ///
    /// The digest covers the canonical serialization of the content fields
    /// and excludes `event_id` and `occurred_at`: events with identical
    /// business content share a checksum (a content-equality fingerprint,
    /// usable for deduplication). Stable across calls; no side effects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the payload cannot be serialized,
    /// which cannot happen for values built from [`serde_json::Value`].
    pub fn checksum(&self) -> Result<String> {
        let body = ChecksumBody {
            event_type: &self.event_type,
            aggregate_id: self.aggregate_id.as_str(),
            aggregate_type: &self.aggregate_type,
            publisher: &self.publisher,
            data: &self.data,
            metadata: &self.metadata,
            priority: self.priority,
            delivery_mode: self.delivery_mode,
        };
        let canonical = serde_json::to_vec(&body)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Snapshot the identity and routing fields for logging and metrics.
    ///
    /// Pure projection; the event itself is untouched and the snapshot omits
    /// the payload.
    #[must_use]
    pub fn to_metadata(&self) -> EventMetadata {
        EventMetadata {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            publisher: self.publisher.clone(),
            priority: self.priority,
            delivery_mode: self.delivery_mode,
            occurred_at: self.occurred_at,
        }
    }
}

/// Read-only projection of an event's identity and routing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub publisher: String,
    pub priority: EventPriority,
    pub delivery_mode: DeliveryMode,
    pub occurred_at: DateTime<Utc>,
}

/// Builder for [`Event`].
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_type: String,
    aggregate_id: AggregateId,
    aggregate_type: String,
    publisher: String,
    data: Value,
    metadata: Value,
    priority: EventPriority,
    delivery_mode: DeliveryMode,
}

impl EventBuilder {
    fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_id: AggregateId::new(""),
            aggregate_type: String::new(),
            publisher: String::new(),
            data: Value::Null,
            metadata: Value::Null,
            priority: EventPriority::default(),
            delivery_mode: DeliveryMode::default(),
        }
    }

    /// Set the aggregate this event belongs to.
    #[must_use]
    pub fn aggregate(mut self, id: impl Into<AggregateId>, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_id = id.into();
        self.aggregate_type = aggregate_type.into();
        self
    }

    /// Set the logical name of the producing component.
    #[must_use]
    pub fn publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = publisher.into();
        self
    }

    /// Set the structured payload.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Set the side-channel metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the delivery mode.
    #[must_use]
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Validate the identity fields and produce the immutable event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] naming the first empty identity field
    /// (`event_type`, `aggregate_id`, `aggregate_type`, or `publisher`).
    /// Missing identity is never silently defaulted.
    pub fn build(self) -> Result<Event> {
        if self.event_type.is_empty() {
            return Err(Error::invalid_event("event_type is empty"));
        }
        if self.aggregate_id.is_empty() {
            return Err(Error::invalid_event("aggregate_id is empty"));
        }
        if self.aggregate_type.is_empty() {
            return Err(Error::invalid_event("aggregate_type is empty"));
        }
        if self.publisher.is_empty() {
            return Err(Error::invalid_event("publisher is empty"));
        }

        Ok(Event {
            event_id: EventId::new(),
            event_type: self.event_type,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            publisher: self.publisher,
            data: self.data,
            metadata: self.metadata,
            priority: self.priority,
            delivery_mode: self.delivery_mode,
            occurred_at: Utc::now(),
        })
    }
}
