//! The bus itself: per-aggregate FIFO queues, dispatch through circuit
//! breakers, dead-letter routing, and a drain-on-shutdown lifecycle.
//!
//! A [`HybridEventBus`] is cheap to clone; clones share all state, so the
//! bus can be handed to every component that publishes or administers it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::dead_letter::{CIRCUIT_OPEN_REASON, DeadLetterQueue};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::handler::EventHandler;
use crate::metrics::{BusMetrics, HandlerSnapshot, ShutdownReport};
use crate::queue::{AggregateQueue, EnqueueOutcome};
use crate::sink::EventSink;
use crate::types::{AggregateId, DeliveryMode};

/// Lifecycle state of the bus.
///
/// Valid transitions are `Stopped -> Starting -> Running -> Stopping ->
/// Stopped`; a stopped bus may be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        write!(f, "{label}")
    }
}

/// Tunables for queue depth, breaker behavior, and queue lifetime.
///
/// Values that would make a component inert (a zero queue depth or
/// failure threshold) are raised to one by the component constructors.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum number of buffered events per aggregate queue.
    pub max_queue_depth: usize,
    /// Consecutive handler failures that open a circuit breaker.
    pub failure_threshold: u32,
    /// How long an open breaker waits before admitting a trial event.
    pub breaker_cooldown: Duration,
    /// Maximum number of retained dead-letter entries.
    pub dead_letter_capacity: usize,
    /// How long an empty queue may sit idle before its worker retires it.
    pub idle_queue_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 1024,
            failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            dead_letter_capacity: 1024,
            idle_queue_timeout: Duration::from_secs(5),
        }
    }
}

/// A registered handler and the breaker guarding it.
#[derive(Clone)]
struct HandlerEntry {
    handler: Arc<dyn EventHandler>,
    breaker: Arc<CircuitBreaker>,
}

/// A live aggregate queue and the worker task draining it.
struct AggregateEntry {
    queue: Arc<AggregateQueue>,
    worker: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
}

struct BusInner {
    config: BusConfig,
    state: RwLock<BusState>,
    /// Lock order: take this map lock before any queue-internal lock,
    /// never the other way around.
    queues: RwLock<HashMap<AggregateId, AggregateEntry>>,
    handlers: RwLock<HashMap<String, HandlerEntry>>,
    dead_letters: Arc<DeadLetterQueue>,
    sink: Option<Arc<dyn EventSink>>,
    counters: Counters,
    shutdown: watch::Sender<bool>,
}

/// An in-process event bus with per-aggregate ordering, per-handler
/// circuit breakers, bounded queues, and a dead-letter queue.
///
/// Events for the same aggregate are dispatched strictly in publish
/// order by a dedicated worker task; different aggregates proceed
/// independently. Handlers are registered by name with [`subscribe`]
/// and guarded by individual breakers, so one failing consumer cannot
/// stall the rest. Subscriptions survive [`stop`] and apply again after
/// a restart.
///
/// [`subscribe`]: HybridEventBus::subscribe
/// [`stop`]: HybridEventBus::stop
#[derive(Clone)]
pub struct HybridEventBus {
    inner: Arc<BusInner>,
}

impl HybridEventBus {
    /// Creates a bus with default configuration and no durability sink.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a bus.
    #[must_use]
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    /// The configuration this bus was built with.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> BusState {
        *self.inner.state.read().await
    }

    /// Whether the bus currently accepts publishes.
    pub async fn is_running(&self) -> bool {
        self.state().await == BusState::Running
    }

    /// Handle to the dead-letter queue for inspection, replay, or purge.
    #[must_use]
    pub fn dead_letters(&self) -> Arc<DeadLetterQueue> {
        Arc::clone(&self.inner.dead_letters)
    }

    /// Number of aggregate queues currently alive. Idle queues are
    /// retired in the background, so this decays toward zero on a
    /// quiet bus.
    pub async fn active_aggregates(&self) -> usize {
        self.inner.queues.read().await.len()
    }

    /// Transitions the bus from `stopped` to `running`.
    ///
    /// Aggregate workers are spawned lazily on first publish, so start
    /// itself is cheap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the bus is not stopped.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let current = *state;
        if current != BusState::Stopped {
            return Err(Error::invalid_state("start", current.to_string()));
        }
        *state = BusState::Starting;
        // Re-arm the shutdown signal so workers spawned from now on see
        // a live bus even after a previous stop.
        self.inner.shutdown.send_replace(false);
        *state = BusState::Running;
        info!("event bus started");
        Ok(())
    }

    /// Stops the bus, draining in-flight queues for up to `timeout`.
    ///
    /// New publishes are rejected immediately. Each aggregate worker is
    /// given the remaining share of the timeout to finish its queue;
    /// workers still busy at the deadline are abandoned (left to finish
    /// in the background, never aborted mid-handler) and counted in the
    /// returned [`ShutdownReport`]. The bus always reaches `stopped`,
    /// and may be started again afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the bus is not running.
    pub async fn stop(&self, timeout: Duration) -> Result<ShutdownReport> {
        let started = Instant::now();
        {
            let mut state = self.inner.state.write().await;
            let current = *state;
            if current != BusState::Running {
                return Err(Error::invalid_state("stop", current.to_string()));
            }
            *state = BusState::Stopping;
        }
        info!(timeout = ?timeout, "event bus stopping");
        self.inner.shutdown.send_replace(true);

        let entries: Vec<(AggregateId, AggregateEntry)> =
            self.inner.queues.write().await.drain().collect();

        let mut drained = 0;
        let mut abandoned = 0;
        for (aggregate_id, entry) in entries {
            let remaining = timeout.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, entry.worker).await {
                Ok(Ok(())) => drained += 1,
                Ok(Err(join_err)) => {
                    warn!(
                        aggregate_id = %aggregate_id,
                        error = %join_err,
                        "aggregate worker crashed before drain"
                    );
                    drained += 1;
                }
                Err(_) => {
                    abandoned += 1;
                    warn!(
                        aggregate_id = %aggregate_id,
                        queued = entry.queue.len().await,
                        "aggregate worker abandoned at shutdown deadline"
                    );
                }
            }
        }

        *self.inner.state.write().await = BusState::Stopped;

        let report = ShutdownReport {
            drained,
            abandoned,
            elapsed: started.elapsed(),
        };
        if report.is_clean() {
            info!(drained = report.drained, "event bus stopped");
        } else {
            warn!(
                drained = report.drained,
                abandoned = report.abandoned,
                "event bus stopped with work left in flight"
            );
        }
        Ok(report)
    }

    /// Registers a handler under its [`EventHandler::name`].
    ///
    /// Subscribing a handler whose name is already registered replaces
    /// the previous handler and resets its circuit breaker.
    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        let name = handler.name().to_owned();
        let entry = HandlerEntry {
            handler,
            breaker: Arc::new(CircuitBreaker::new(
                self.inner.config.failure_threshold,
                self.inner.config.breaker_cooldown,
            )),
        };
        let replaced = self
            .inner
            .handlers
            .write()
            .await
            .insert(name.clone(), entry)
            .is_some();
        info!(handler = %name, replaced, "handler subscribed");
    }

    /// Removes a handler by name. Returns whether anything was removed.
    pub async fn unsubscribe(&self, handler_name: &str) -> bool {
        let removed = self
            .inner
            .handlers
            .write()
            .await
            .remove(handler_name)
            .is_some();
        if removed {
            info!(handler = handler_name, "handler unsubscribed");
        } else {
            debug!(handler = handler_name, "unsubscribe ignored: unknown handler");
        }
        removed
    }

    /// Publishes an event to its aggregate's queue.
    ///
    /// Returns `Ok(true)` when the event was accepted and `Ok(false)`
    /// when the aggregate's queue is full; a full queue is backpressure,
    /// not an error, and the call never blocks waiting for space. When a
    /// durability sink is configured the event is appended to it before
    /// queueing; sink failures are logged and do not fail the publish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the bus is not running.
    pub async fn publish(&self, event: Event) -> Result<bool> {
        {
            let state = self.inner.state.read().await;
            if *state != BusState::Running {
                return Err(Error::invalid_state("publish", state.to_string()));
            }
        }

        if let Some(sink) = &self.inner.sink {
            if let Err(err) = sink.append(&event).await {
                warn!(
                    event_id = %event.event_id(),
                    error = %err,
                    "sink append failed; delivering event without durability"
                );
            }
        }

        loop {
            let queue = self.inner.resolve_queue(event.aggregate_id()).await;
            match queue.offer(&event).await {
                EnqueueOutcome::Accepted => {
                    self.inner.counters.published.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        event_id = %event.event_id(),
                        event_type = event.event_type(),
                        aggregate_id = %event.aggregate_id(),
                        "event published"
                    );
                    return Ok(true);
                }
                EnqueueOutcome::Full => {
                    debug!(
                        aggregate_id = %event.aggregate_id(),
                        depth = queue.max_size(),
                        "publish rejected: aggregate queue full"
                    );
                    return Ok(false);
                }
                // The queue was retired between lookup and offer; a
                // fresh resolve recreates it.
                EnqueueOutcome::Closed => {}
            }
        }
    }

    /// Re-publishes up to `max_events` dead-letter entries, oldest first.
    ///
    /// See [`DeadLetterQueue::replay`] for the stopping rules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the bus is not running.
    pub async fn replay_dead_letters(&self, max_events: usize) -> Result<usize> {
        let dead_letters = Arc::clone(&self.inner.dead_letters);
        dead_letters.replay(self, max_events).await
    }

    /// A point-in-time snapshot of counters, queue depths, and breaker
    /// states.
    pub async fn metrics(&self) -> BusMetrics {
        let state = self.state().await;

        let queue_depths = {
            let queues = self.inner.queues.read().await;
            let mut depths = HashMap::with_capacity(queues.len());
            for (aggregate_id, entry) in queues.iter() {
                depths.insert(aggregate_id.to_string(), entry.queue.len().await);
            }
            depths
        };

        let handlers = {
            let registry = self.inner.handlers.read().await;
            registry
                .iter()
                .map(|(name, entry)| {
                    (
                        name.clone(),
                        HandlerSnapshot {
                            breaker_state: entry.breaker.state(),
                            failure_count: entry.breaker.failure_count(),
                        },
                    )
                })
                .collect()
        };

        BusMetrics {
            running: state == BusState::Running,
            state,
            events_published: self.inner.counters.published.load(Ordering::SeqCst),
            events_dispatched: self.inner.counters.dispatched.load(Ordering::SeqCst),
            events_failed: self.inner.counters.failed.load(Ordering::SeqCst),
            events_dead_lettered: self.inner.counters.dead_lettered.load(Ordering::SeqCst),
            events_dropped: self.inner.counters.dropped.load(Ordering::SeqCst),
            queue_depths,
            handlers,
            dead_letters: self.inner.dead_letters.stats().await,
        }
    }
}

impl Default for HybridEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusInner {
    /// Returns the live queue for `aggregate_id`, creating it and
    /// spawning its worker if none exists.
    async fn resolve_queue(self: &Arc<Self>, aggregate_id: &AggregateId) -> Arc<AggregateQueue> {
        {
            let queues = self.queues.read().await;
            if let Some(entry) = queues.get(aggregate_id) {
                return Arc::clone(&entry.queue);
            }
        }

        let mut queues = self.queues.write().await;
        // Another publisher may have created the queue while we waited
        // for the write lock.
        if let Some(entry) = queues.get(aggregate_id) {
            return Arc::clone(&entry.queue);
        }

        let queue = Arc::new(AggregateQueue::new(
            aggregate_id.clone(),
            self.config.max_queue_depth,
        ));
        let worker = tokio::spawn(run_aggregate_worker(
            Arc::clone(self),
            aggregate_id.clone(),
            Arc::clone(&queue),
        ));
        debug!(aggregate_id = %aggregate_id, "aggregate queue created");
        queues.insert(
            aggregate_id.clone(),
            AggregateEntry {
                queue: Arc::clone(&queue),
                worker,
            },
        );
        queue
    }

    /// Closes `queue` if it is still empty and removes its registry
    /// entry, provided the entry still refers to this exact queue (a
    /// worker that outlived a restart must not unregister its
    /// successor). Returns true when the calling worker should exit.
    async fn retire_queue(&self, aggregate_id: &AggregateId, queue: &Arc<AggregateQueue>) -> bool {
        let mut queues = self.queues.write().await;
        if !queue.close_if_empty().await {
            return false;
        }
        if let Some(entry) = queues.get(aggregate_id) {
            if Arc::ptr_eq(&entry.queue, queue) {
                queues.remove(aggregate_id);
            }
        }
        debug!(aggregate_id = %aggregate_id, "aggregate queue retired");
        true
    }

    /// Delivers one event to every matching handler, routing failures
    /// and breaker rejections per the event's delivery mode.
    async fn dispatch(&self, event: &Event) {
        // Snapshot the registry so no lock is held across handler calls.
        let handlers: Vec<(String, HandlerEntry)> = {
            let registry = self.handlers.read().await;
            registry
                .iter()
                .map(|(name, entry)| (name.clone(), entry.clone()))
                .collect()
        };

        for (name, entry) in handlers {
            if !entry.handler.filter().matches(event) {
                continue;
            }

            if !entry.breaker.allow_request() {
                debug!(
                    event_id = %event.event_id(),
                    handler = %name,
                    "dispatch skipped: circuit open"
                );
                self.quarantine(event, CIRCUIT_OPEN_REASON, &name).await;
                continue;
            }

            match entry.handler.handle(event).await {
                Ok(()) => {
                    entry.breaker.record_success();
                    self.counters.dispatched.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    entry.breaker.record_failure();
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        event_id = %event.event_id(),
                        event_type = event.event_type(),
                        handler = %name,
                        error = %err,
                        "handler failed"
                    );
                    self.quarantine(event, err.message(), &name).await;
                }
            }
        }
    }

    /// Routes an undeliverable event: dead-letter it for at-least-once
    /// delivery, drop it for at-most-once.
    async fn quarantine(&self, event: &Event, reason: &str, handler_name: &str) {
        match event.delivery_mode() {
            DeliveryMode::AtLeastOnce => {
                self.dead_letters
                    .add_event(event.clone(), reason, handler_name)
                    .await;
                self.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
            }
            DeliveryMode::AtMostOnce => {
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                debug!(
                    event_id = %event.event_id(),
                    handler = %handler_name,
                    "at-most-once event dropped"
                );
            }
        }
    }
}

/// Drains one aggregate's queue in FIFO order until shutdown, retiring
/// the queue if it stays empty past the idle timeout.
async fn run_aggregate_worker(
    inner: Arc<BusInner>,
    aggregate_id: AggregateId,
    queue: Arc<AggregateQueue>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    debug!(aggregate_id = %aggregate_id, "aggregate worker started");

    loop {
        while let Some(event) = queue.dequeue().await {
            inner.dispatch(&event).await;
        }

        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            () = queue.wait_for_event() => {}
            _ = shutdown.changed() => {}
            () = tokio::time::sleep(inner.config.idle_queue_timeout) => {
                if inner.retire_queue(&aggregate_id, &queue).await {
                    return;
                }
            }
        }
    }

    // Shutdown drain: close the queue before exiting so a late
    // publisher falls through to a fresh queue instead of a dead one.
    // Looping covers an offer that lands between the drain and the
    // close.
    while !inner.retire_queue(&aggregate_id, &queue).await {
        while let Some(event) = queue.dequeue().await {
            inner.dispatch(&event).await;
        }
    }
    debug!(aggregate_id = %aggregate_id, "aggregate worker drained and stopped");
}

/// Configures and constructs a [`HybridEventBus`].
#[derive(Default)]
pub struct BusBuilder {
    config: BusConfig,
    sink: Option<Arc<dyn EventSink>>,
}

impl BusBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of buffered events per aggregate queue.
    #[must_use]
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.config.max_queue_depth = depth;
        self
    }

    /// Consecutive handler failures that open a circuit breaker.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// How long an open breaker waits before admitting a trial event.
    #[must_use]
    pub fn with_breaker_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.breaker_cooldown = cooldown;
        self
    }

    /// Maximum number of retained dead-letter entries; older entries
    /// are evicted first.
    #[must_use]
    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.config.dead_letter_capacity = capacity;
        self
    }

    /// How long an empty queue may sit idle before its worker retires it.
    #[must_use]
    pub fn with_idle_queue_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_queue_timeout = timeout;
        self
    }

    /// Appends every published event to `sink` before queueing it.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn build(self) -> HybridEventBus {
        let (shutdown, _) = watch::channel(false);
        HybridEventBus {
            inner: Arc::new(BusInner {
                dead_letters: Arc::new(DeadLetterQueue::new(self.config.dead_letter_capacity)),
                config: self.config,
                state: RwLock::new(BusState::Stopped),
                queues: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                sink: self.sink,
                counters: Counters::default(),
                shutdown,
            }),
        }
    }
}
