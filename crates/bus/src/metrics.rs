//! Read-only observability snapshots exposed by the bus.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::breaker::BreakerState;
use crate::bus::BusState;
use crate::dead_letter::DeadLetterStats;

/// Point-in-time view of the bus: counters, per-handler breaker states, and
/// per-aggregate queue depths. Serializable for telemetry export; taking a
/// snapshot has no side effects.
#[derive(Debug, Clone, Serialize)]
pub struct BusMetrics {
    /// True while the bus accepts publishes.
    pub running: bool,
    /// Current lifecycle state.
    pub state: BusState,
    /// Events accepted by `publish`.
    pub events_published: u64,
    /// Successful handler invocations.
    pub events_dispatched: u64,
    /// Failed handler invocations.
    pub events_failed: u64,
    /// Events routed to the dead-letter queue.
    pub events_dead_lettered: u64,
    /// At-most-once events dropped on failure or open circuit.
    pub events_dropped: u64,
    /// Pending events per active aggregate.
    pub queue_depths: HashMap<String, usize>,
    /// Breaker view per subscribed handler.
    pub handlers: HashMap<String, HandlerSnapshot>,
    /// Dead-letter queue counters.
    pub dead_letters: DeadLetterStats,
}

/// Breaker view of one subscribed handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HandlerSnapshot {
    pub breaker_state: BreakerState,
    pub failure_count: u32,
}

/// Outcome of a graceful stop.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ShutdownReport {
    /// Workers that finished draining within the timeout.
    pub drained: usize,
    /// Workers still running at the deadline, left to finish in the
    /// background.
    pub abandoned: usize,
    /// Wall time the stop took.
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// True when every worker drained within the timeout.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.abandoned == 0
    }
}
