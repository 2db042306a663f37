//! Core identity and delivery types for the bus.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for an event.
///
/// ULIDs are lexicographically sortable by creation time, which keeps sink
/// journals and dead-letter snapshots naturally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Ulid);

impl EventId {
    /// Create a new random event ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Create from a ULID.
    #[must_use]
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Get the inner ULID.
    #[must_use]
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the logical stream an event belongs to.
///
/// Free-form, chosen by the publisher (e.g. `"patient-123"`). All events
/// sharing an aggregate ID are dispatched in publish order relative to each
/// other; events on different aggregate IDs have no ordering relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateId(String);

impl AggregateId {
    /// Create an aggregate ID from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the ID is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for AggregateId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for AggregateId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relative importance of an event.
///
/// Informs dead-letter triage and downstream scheduling. Priority never
/// reorders events within an aggregate; ordering stays aggregate-scoped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Best-effort background traffic.
    Low,
    /// Everyday traffic.
    #[default]
    Normal,
    /// Time-sensitive traffic.
    High,
    /// Must-not-lose traffic; first in line for replay triage.
    Critical,
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{label}")
    }
}

/// What the bus does with an event whose dispatch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Fire and forget: a failed or skipped dispatch drops the event.
    AtMostOnce,
    /// Failed or skipped dispatches are preserved in the dead-letter queue
    /// for inspection and replay.
    #[default]
    AtLeastOnce,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::AtMostOnce => "at_most_once",
            Self::AtLeastOnce => "at_least_once",
        };
        write!(f, "{label}")
    }
}
