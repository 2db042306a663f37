//! Failure-isolation tests: circuit breakers, dead-letter replay, typed
//! filtering, backpressure, and the durability sink.
//!
//! # Quality Standards
//! - Zero unwraps in tests
//! - Deterministic failure injection (no random fault schedules)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use caravan_bus::{
    AggregateId, BreakerState, CIRCUIT_OPEN_REASON, Event, EventHandler, HandlerResult,
    HybridEventBus, InMemorySink, TypedEventHandler,
};

/// Fails every event while `healthy` is false; counts every attempt.
struct Flaky {
    name: String,
    healthy: AtomicBool,
    attempts: AtomicUsize,
}

impl Flaky {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            healthy: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        })
    }

    fn heal(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for Flaky {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _event: &Event) -> HandlerResult {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("induced failure".into())
        }
    }
}

/// Counts handled events and records their types.
struct Tally {
    name: String,
    handled: AtomicUsize,
    types: tokio::sync::Mutex<Vec<String>>,
}

impl Tally {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            handled: AtomicUsize::new(0),
            types: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for Tally {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> HandlerResult {
        self.handled.fetch_add(1, Ordering::SeqCst);
        self.types.lock().await.push(event.event_type().to_owned());
        Ok(())
    }
}

/// Signals when it starts handling, then blocks until the gate opens.
struct Gated {
    name: String,
    entered: mpsc::UnboundedSender<()>,
    gate: watch::Receiver<bool>,
    handled: AtomicUsize,
}

#[async_trait]
impl EventHandler for Gated {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _event: &Event) -> HandlerResult {
        self.handled.fetch_add(1, Ordering::SeqCst);
        let _ = self.entered.send(());
        let mut gate = self.gate.clone();
        while !*gate.borrow() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

fn order_event(event_type: &str, aggregate: &str) -> Result<Event, String> {
    Event::builder(event_type)
        .aggregate(aggregate, "order")
        .publisher("reliability-tests")
        .build()
        .map_err(|e| format!("failed to build event: {e}"))
}

async fn wait_for_dead_letters(bus: &HybridEventBus, count: usize) -> Result<(), String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if bus.dead_letters().len().await >= count {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(format!(
                "dead-letter queue never reached {count} entries (has {})",
                bus.dead_letters().len().await
            ));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn breaker_opens_at_threshold_and_short_circuits_the_rest() -> Result<(), String> {
    let bus = HybridEventBus::builder()
        .with_failure_threshold(3)
        .with_breaker_cooldown(Duration::from_secs(600))
        .build();
    let flaky = Flaky::new("projector");
    bus.subscribe(flaky.clone()).await;
    bus.start().await.map_err(|e| format!("start failed: {e}"))?;

    for i in 0..10 {
        let accepted = bus
            .publish(order_event("order.placed", "order-1")?)
            .await
            .map_err(|e| format!("publish {i} failed: {e}"))?;
        if !accepted {
            return Err(format!("event {i} rejected by backpressure"));
        }
    }

    let report = bus
        .stop(Duration::from_secs(5))
        .await
        .map_err(|e| format!("stop failed: {e}"))?;
    if !report.is_clean() {
        return Err(format!("shutdown abandoned {} workers", report.abandoned));
    }

    // Three failures trip the breaker; the remaining seven events are
    // never offered to the handler.
    if flaky.attempts() != 3 {
        return Err(format!("expected 3 attempts, handler saw {}", flaky.attempts()));
    }

    let metrics = bus.metrics().await;
    if metrics.events_failed != 3 {
        return Err(format!("expected 3 failures, got {}", metrics.events_failed));
    }
    if metrics.events_dead_lettered != 10 {
        return Err(format!(
            "expected all 10 events dead-lettered, got {}",
            metrics.events_dead_lettered
        ));
    }
    let snapshot = metrics
        .handlers
        .get("projector")
        .ok_or("projector missing from metrics")?;
    if snapshot.breaker_state != BreakerState::Open {
        return Err(format!(
            "expected open breaker, got {}",
            snapshot.breaker_state
        ));
    }

    let entries = bus.dead_letters().entries().await;
    let open_rejections = entries
        .iter()
        .filter(|entry| entry.reason == CIRCUIT_OPEN_REASON)
        .count();
    if open_rejections != 7 {
        return Err(format!(
            "expected 7 circuit-open rejections, got {open_rejections}"
        ));
    }
    Ok(())
}

#[tokio::test]
async fn breaker_cooldown_admits_trial_and_closes_on_success() -> Result<(), String> {
    let bus = HybridEventBus::builder()
        .with_failure_threshold(1)
        .with_breaker_cooldown(Duration::from_millis(100))
        .build();
    let flaky = Flaky::new("projector");
    bus.subscribe(flaky.clone()).await;
    bus.start().await.map_err(|e| format!("start failed: {e}"))?;

    bus.publish(order_event("order.placed", "order-1")?)
        .await
        .map_err(|e| format!("publish failed: {e}"))?;
    wait_for_dead_letters(&bus, 1).await?;

    // Heal the handler and let the cooldown elapse so the next event is
    // admitted as a trial.
    flaky.heal();
    tokio::time::sleep(Duration::from_millis(150)).await;

    bus.publish(order_event("order.placed", "order-1")?)
        .await
        .map_err(|e| format!("publish failed: {e}"))?;

    let report = bus
        .stop(Duration::from_secs(5))
        .await
        .map_err(|e| format!("stop failed: {e}"))?;
    if !report.is_clean() {
        return Err(format!("shutdown abandoned {} workers", report.abandoned));
    }

    if flaky.attempts() != 2 {
        return Err(format!("expected 2 attempts, handler saw {}", flaky.attempts()));
    }
    let metrics = bus.metrics().await;
    let snapshot = metrics
        .handlers
        .get("projector")
        .ok_or("projector missing from metrics")?;
    if snapshot.breaker_state != BreakerState::Closed {
        return Err(format!(
            "expected closed breaker after successful trial, got {}",
            snapshot.breaker_state
        ));
    }
    if snapshot.failure_count != 0 {
        return Err(format!(
            "expected failure count reset to 0, got {}",
            snapshot.failure_count
        ));
    }
    Ok(())
}

#[tokio::test]
async fn dead_letters_replay_through_the_publish_path() -> Result<(), String> {
    let bus = HybridEventBus::builder()
        .with_failure_threshold(1)
        .with_breaker_cooldown(Duration::from_secs(600))
        .build();
    let flaky = Flaky::new("projector");
    bus.subscribe(flaky.clone()).await;
    bus.start().await.map_err(|e| format!("start failed: {e}"))?;

    bus.publish(order_event("order.placed", "order-1")?)
        .await
        .map_err(|e| format!("publish failed: {e}"))?;
    wait_for_dead_letters(&bus, 1).await?;

    // Replace the handler under the same name: fresh breaker, healthy
    // implementation. The dead-lettered event can now be replayed.
    let fixed = Tally::new("projector");
    bus.subscribe(fixed.clone()).await;

    let replayed = bus
        .replay_dead_letters(10)
        .await
        .map_err(|e| format!("replay failed: {e}"))?;
    if replayed != 1 {
        return Err(format!("expected 1 replayed event, got {replayed}"));
    }
    if !bus.dead_letters().is_empty().await {
        return Err("dead-letter queue should be empty after replay".to_string());
    }

    let report = bus
        .stop(Duration::from_secs(5))
        .await
        .map_err(|e| format!("stop failed: {e}"))?;
    if !report.is_clean() {
        return Err(format!("shutdown abandoned {} workers", report.abandoned));
    }

    if fixed.handled() != 1 {
        return Err(format!(
            "replacement handler saw {} events, expected 1",
            fixed.handled()
        ));
    }
    // Original publish plus the replay both count as publishes.
    let metrics = bus.metrics().await;
    if metrics.events_published != 2 {
        return Err(format!(
            "expected 2 published events, got {}",
            metrics.events_published
        ));
    }
    Ok(())
}

#[tokio::test]
async fn typed_handler_receives_only_subscribed_types() -> Result<(), String> {
    let bus = HybridEventBus::new();
    let tally = Tally::new("order-view");
    let typed = Arc::new(TypedEventHandler::new(
        tally.clone(),
        ["order.placed", "order.cancelled"],
    ));
    bus.subscribe(typed).await;
    bus.start().await.map_err(|e| format!("start failed: {e}"))?;

    for event_type in ["order.placed", "shipment.created", "order.cancelled", "invoice.sent"] {
        bus.publish(order_event(event_type, "order-1")?)
            .await
            .map_err(|e| format!("publish failed: {e}"))?;
    }

    let report = bus
        .stop(Duration::from_secs(5))
        .await
        .map_err(|e| format!("stop failed: {e}"))?;
    if !report.is_clean() {
        return Err(format!("shutdown abandoned {} workers", report.abandoned));
    }

    if tally.handled() != 2 {
        return Err(format!(
            "typed handler saw {} events, expected 2",
            tally.handled()
        ));
    }
    let types = tally.types.lock().await.clone();
    if types != ["order.placed", "order.cancelled"] {
        return Err(format!("typed handler saw unexpected types: {types:?}"));
    }
    // Filtered-out events are not failures: nothing dead-lettered.
    if !bus.dead_letters().is_empty().await {
        return Err("filtered events must not be dead-lettered".to_string());
    }
    Ok(())
}

#[tokio::test]
async fn full_queue_rejects_publish_without_blocking() -> Result<(), String> {
    let bus = HybridEventBus::builder().with_max_queue_depth(1).build();
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let (gate_tx, gate_rx) = watch::channel(false);
    let gated = Arc::new(Gated {
        name: "slow-consumer".to_owned(),
        entered: entered_tx,
        gate: gate_rx,
        handled: AtomicUsize::new(0),
    });
    bus.subscribe(gated.clone()).await;
    bus.start().await.map_err(|e| format!("start failed: {e}"))?;

    // First event: dequeued immediately and parked inside the handler.
    let first = bus
        .publish(order_event("order.placed", "order-1")?)
        .await
        .map_err(|e| format!("publish failed: {e}"))?;
    if !first {
        return Err("first publish should be accepted".to_string());
    }
    tokio::time::timeout(Duration::from_secs(2), entered_rx.recv())
        .await
        .map_err(|_| "handler never started".to_string())?
        .ok_or("entered channel closed early")?;

    // Second event fills the single queue slot; third must be rejected.
    let second = bus
        .publish(order_event("order.placed", "order-1")?)
        .await
        .map_err(|e| format!("publish failed: {e}"))?;
    if !second {
        return Err("second publish should occupy the queue slot".to_string());
    }
    let publish_started = Instant::now();
    let third = bus
        .publish(order_event("order.placed", "order-1")?)
        .await
        .map_err(|e| format!("publish failed: {e}"))?;
    if third {
        return Err("third publish should be rejected while the queue is full".to_string());
    }
    if publish_started.elapsed() > Duration::from_millis(500) {
        return Err("rejected publish appears to have blocked".to_string());
    }

    gate_tx.send(true).map_err(|e| format!("gate failed: {e}"))?;
    let report = bus
        .stop(Duration::from_secs(5))
        .await
        .map_err(|e| format!("stop failed: {e}"))?;
    if !report.is_clean() {
        return Err(format!("shutdown abandoned {} workers", report.abandoned));
    }

    if gated.handled.load(Ordering::SeqCst) != 2 {
        return Err(format!(
            "expected 2 handled events, got {}",
            gated.handled.load(Ordering::SeqCst)
        ));
    }
    let metrics = bus.metrics().await;
    if metrics.events_published != 2 {
        return Err(format!(
            "rejected event must not count as published, got {}",
            metrics.events_published
        ));
    }
    Ok(())
}

#[tokio::test]
async fn sink_captures_events_before_dispatch() -> Result<(), String> {
    let sink = InMemorySink::new_arc();
    let bus = HybridEventBus::builder().with_sink(sink.clone()).build();
    let tally = Tally::new("audit");
    bus.subscribe(tally.clone()).await;
    bus.start().await.map_err(|e| format!("start failed: {e}"))?;

    bus.publish(order_event("order.placed", "order-1")?)
        .await
        .map_err(|e| format!("publish failed: {e}"))?;
    bus.publish(order_event("order.shipped", "order-1")?)
        .await
        .map_err(|e| format!("publish failed: {e}"))?;
    bus.publish(order_event("order.placed", "order-2")?)
        .await
        .map_err(|e| format!("publish failed: {e}"))?;

    let report = bus
        .stop(Duration::from_secs(5))
        .await
        .map_err(|e| format!("stop failed: {e}"))?;
    if !report.is_clean() {
        return Err(format!("shutdown abandoned {} workers", report.abandoned));
    }

    if sink.len().await != 3 {
        return Err(format!("sink recorded {} events, expected 3", sink.len().await));
    }
    let order_1 = sink.events_for_aggregate(&AggregateId::from("order-1")).await;
    if order_1.len() != 2 {
        return Err(format!(
            "sink recorded {} events for order-1, expected 2",
            order_1.len()
        ));
    }
    if tally.handled() != 3 {
        return Err(format!("handler saw {} events, expected 3", tally.handled()));
    }
    Ok(())
}
