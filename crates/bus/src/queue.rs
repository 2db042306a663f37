//! Bounded FIFO queue holding one aggregate's pending events.
//!
//! Many producers enqueue concurrently; the aggregate's single worker
//! dequeues. Capacity is enforced by rejecting the enqueue (backpressure),
//! never by blocking the producer.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::event::Event;
use crate::types::AggregateId;

/// Outcome of offering an event to a queue.
///
/// `Closed` is only observable through a stale handle to a queue the bus has
/// garbage-collected; the publish path reacts by re-resolving the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    Accepted,
    Full,
    Closed,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<Event>,
    closed: bool,
}

/// Bounded FIFO of events for a single aggregate.
#[derive(Debug)]
pub struct AggregateQueue {
    aggregate_id: AggregateId,
    max_size: usize,
    inner: Mutex<QueueInner>,
    wakeup: Notify,
}

impl AggregateQueue {
    /// Create an empty queue for `aggregate_id` holding at most `max_size`
    /// events (a zero capacity is treated as one).
    #[must_use]
    pub fn new(aggregate_id: impl Into<AggregateId>, max_size: usize) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            max_size: max_size.max(1),
            inner: Mutex::new(QueueInner::default()),
            wakeup: Notify::new(),
        }
    }

    /// The aggregate this queue belongs to.
    #[must_use]
    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    /// Maximum number of pending events.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Append an event at the tail.
    ///
    /// Returns `false` when the queue is at capacity — the backpressure
    /// signal; the caller decides whether to retry, back off, or drop.
    /// Never blocks beyond the internal lock.
    pub async fn enqueue(&self, event: Event) -> bool {
        matches!(self.offer(&event).await, EnqueueOutcome::Accepted)
    }

    pub(crate) async fn offer(&self, event: &Event) -> EnqueueOutcome {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return EnqueueOutcome::Closed;
        }
        if inner.items.len() >= self.max_size {
            return EnqueueOutcome::Full;
        }
        inner.items.push_back(event.clone());
        drop(inner);
        self.wakeup.notify_one();
        EnqueueOutcome::Accepted
    }

    /// Pop the head event, or `None` if the queue is empty (non-blocking
    /// poll semantics).
    pub async fn dequeue(&self) -> Option<Event> {
        self.inner.lock().await.items.pop_front()
    }

    /// Number of pending events.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    /// True when no events are pending.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.items.is_empty()
    }

    /// Close the queue if it holds no events; a closed queue rejects all
    /// further enqueues. Returns whether the queue is now closed.
    ///
    /// Closing is how the bus garbage-collects idle queues without losing
    /// events: the close only succeeds on an empty queue, and a producer that
    /// raced the close sees [`EnqueueOutcome::Closed`] and re-resolves.
    pub(crate) async fn close_if_empty(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.items.is_empty() {
            inner.closed = true;
        }
        inner.closed
    }

    pub(crate) async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Wait until an event has been enqueued since the last wakeup. A
    /// notification that fires with no waiter is buffered, so an enqueue is
    /// never missed between a drain and the next wait.
    pub(crate) async fn wait_for_event(&self) {
        self.wakeup.notified().await;
    }
}
