//! Dead-letter queue: a bounded ring of events that failed dispatch,
//! retained for inspection and replay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bus::HybridEventBus;
use crate::error::Result;
use crate::event::Event;

/// Dead-letter reason recorded when dispatch is skipped on an open breaker.
pub const CIRCUIT_OPEN_REASON: &str = "circuit open";

/// One failed dispatch, with enough context for forensics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The event that failed.
    pub event: Event,
    /// Why it failed: the handler's error message, or
    /// [`CIRCUIT_OPEN_REASON`].
    pub reason: String,
    /// The handler whose dispatch failed or was skipped.
    pub handler_name: String,
    /// When the entry was recorded.
    pub occurred_at: DateTime<Utc>,
}

/// Counters exposed through the bus metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    /// Total entries ever added, including evicted and replayed ones.
    pub events_added: u64,
    /// Entries currently held.
    pub current_size: usize,
}

/// Bounded store of failed events shared by all aggregate workers.
///
/// At capacity the oldest entry is evicted: the store never grows unbounded,
/// trading old failures for visibility into new ones.
#[derive(Debug)]
pub struct DeadLetterQueue {
    max_size: usize,
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    events_added: AtomicU64,
}

impl DeadLetterQueue {
    /// Create a store holding at most `max_size` entries (zero is treated as
    /// one).
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            entries: Mutex::new(VecDeque::new()),
            events_added: AtomicU64::new(0),
        }
    }

    /// Maximum number of retained entries.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Record a failed event with its reason and the handler it failed for,
    /// evicting the oldest entry when over capacity.
    pub async fn add_event(
        &self,
        event: Event,
        reason: impl Into<String>,
        handler_name: impl Into<String>,
    ) {
        let entry = DeadLetterEntry {
            event,
            reason: reason.into(),
            handler_name: handler_name.into(),
            occurred_at: Utc::now(),
        };
        self.events_added.fetch_add(1, Ordering::SeqCst);

        let mut entries = self.entries.lock().await;
        debug!(
            event_id = %entry.event.event_id(),
            handler = %entry.handler_name,
            reason = %entry.reason,
            "event dead-lettered"
        );
        entries.push_back(entry);
        if entries.len() > self.max_size {
            if let Some(evicted) = entries.pop_front() {
                debug!(
                    event_id = %evicted.event.event_id(),
                    "dead letter evicted at capacity"
                );
            }
        }
    }

    /// Re-publish up to `max_events` of the oldest entries through the bus's
    /// normal publish path.
    ///
    /// An entry is removed exactly when its re-publish is accepted; replayed
    /// events re-enter the ordinary breaker and failure path, so success this
    /// time is not guaranteed. A backpressure rejection puts the entry back
    /// at the front and ends the pass, preserving oldest-first order.
    /// Returns the number of entries replayed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidState`] if the bus is not running; the
    /// entry being replayed is retained.
    pub async fn replay(&self, bus: &HybridEventBus, max_events: usize) -> Result<usize> {
        let mut replayed = 0;
        while replayed < max_events {
            let next = { self.entries.lock().await.pop_front() };
            let Some(entry) = next else { break };

            match bus.publish(entry.event.clone()).await {
                Ok(true) => replayed += 1,
                Ok(false) => {
                    self.entries.lock().await.push_front(entry);
                    break;
                }
                Err(err) => {
                    self.entries.lock().await.push_front(entry);
                    return Err(err);
                }
            }
        }
        if replayed > 0 {
            info!(replayed, "replayed dead-lettered events");
        }
        Ok(replayed)
    }

    /// Snapshot of the current entries, oldest first.
    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Number of entries currently held.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True when no entries are held.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop all entries, returning how many were discarded. `events_added`
    /// keeps counting across purges.
    pub async fn purge(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let purged = entries.len();
        entries.clear();
        if purged > 0 {
            info!(purged, "dead letter queue purged");
        }
        purged
    }

    /// Counter snapshot for metrics.
    pub async fn stats(&self) -> DeadLetterStats {
        DeadLetterStats {
            events_added: self.events_added.load(Ordering::SeqCst),
            current_size: self.entries.lock().await.len(),
        }
    }
}
