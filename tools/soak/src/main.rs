#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]

//! Soak harness for the caravan event bus.
//!
//! Publishes a stream of events round-robin across a set of aggregates
//! through a bus with a deliberately flaky subscriber, then reports
//! delivery, failure, and dead-letter counts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use caravan_bus::{Event, EventHandler, HandlerResult, HybridEventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SoakConfig {
    events: u64,
    aggregates: u64,
    fail_percent: u64,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            events: 1000,
            aggregates: 10,
            fail_percent: 0,
        }
    }
}

/// Counts handled events, failing a deterministic slice of them: an
/// event fails when `seq % 100` falls below the configured percentage.
struct FlakyCounter {
    fail_percent: u64,
    handled: AtomicU64,
    failed: AtomicU64,
}

impl FlakyCounter {
    fn new(fail_percent: u64) -> Self {
        Self {
            fail_percent,
            handled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl EventHandler for FlakyCounter {
    fn name(&self) -> &str {
        "soak-counter"
    }

    async fn handle(&self, event: &Event) -> HandlerResult {
        let seq = event
            .data()
            .get("seq")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        if seq % 100 < self.fail_percent {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err("soak-induced failure".into());
        }
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_usage();
        return Ok(());
    }
    let config = parse_args(&args)?;
    run(config).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_usage() {
    println!("Usage: caravan-soak [EVENTS] [AGGREGATES] [FAIL_PERCENT]");
    println!();
    println!("Publishes EVENTS events round-robin across AGGREGATES aggregates");
    println!("with a subscriber that fails FAIL_PERCENT percent of events.");
    println!();
    println!("Defaults: 1000 events, 10 aggregates, 0% failures");
}

fn parse_args(args: &[String]) -> Result<SoakConfig> {
    if args.len() > 3 {
        bail!("unexpected extra arguments: {:?}", &args[3..]);
    }
    let defaults = SoakConfig::default();
    let events = match args.first() {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("EVENTS must be an integer, got {raw:?}"))?,
        None => defaults.events,
    };
    let aggregates = match args.get(1) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("AGGREGATES must be an integer, got {raw:?}"))?,
        None => defaults.aggregates,
    };
    let fail_percent = match args.get(2) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("FAIL_PERCENT must be an integer, got {raw:?}"))?,
        None => defaults.fail_percent,
    };
    if aggregates == 0 {
        bail!("AGGREGATES must be at least 1");
    }
    if fail_percent > 100 {
        bail!("FAIL_PERCENT must be between 0 and 100");
    }
    Ok(SoakConfig {
        events,
        aggregates,
        fail_percent,
    })
}

async fn run(config: SoakConfig) -> Result<()> {
    println!("=== Caravan Soak Harness ===");
    println!("Events: {}", config.events);
    println!("Aggregates: {}", config.aggregates);
    println!("Failure rate: {}%", config.fail_percent);
    println!();

    let bus = HybridEventBus::builder().build();
    let counter = Arc::new(FlakyCounter::new(config.fail_percent));
    bus.subscribe(counter.clone()).await;
    bus.start().await.context("failed to start bus")?;

    let started = Instant::now();
    let mut accepted: u64 = 0;
    let mut rejected: u64 = 0;
    for seq in 0..config.events {
        let aggregate = format!("soak-{}", seq % config.aggregates);
        let event = Event::builder("soak.tick")
            .aggregate(aggregate, "soak")
            .publisher("caravan-soak")
            .data(json!({ "seq": seq }))
            .build()
            .context("failed to build event")?;
        if bus.publish(event).await.context("publish failed")? {
            accepted += 1;
        } else {
            rejected += 1;
            // Backpressure: let the workers catch up before moving on.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    let publish_elapsed = started.elapsed();
    info!(accepted, rejected, "publish phase complete");

    let report = bus
        .stop(Duration::from_secs(30))
        .await
        .context("failed to stop bus")?;
    let metrics = bus.metrics().await;

    println!("=== Soak Complete ===");
    println!("Publish wall time: {publish_elapsed:?}");
    println!("Accepted: {accepted}");
    println!("Rejected by backpressure: {rejected}");
    println!("Dispatched: {}", metrics.events_dispatched);
    println!("Handler successes: {}", counter.handled.load(Ordering::SeqCst));
    println!("Handler failures: {}", counter.failed.load(Ordering::SeqCst));
    println!("Dead-lettered: {}", metrics.events_dead_lettered);
    println!(
        "Drain: {} workers drained, {} abandoned in {:?}",
        report.drained, report.abandoned, report.elapsed
    );
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&metrics).context("failed to render metrics")?
    );

    if !report.is_clean() {
        bail!("drain abandoned {} workers", report.abandoned);
    }
    Ok(())
}
