//! Aggregate-ordered in-process event bus with failure isolation.
//!
//! This crate provides a hybrid event bus for services that need ordering
//! and resilience without an external broker. Key features:
//!
//! - **Per-aggregate ordering**: events for one aggregate are dispatched
//!   strictly in publish order; different aggregates proceed in parallel
//! - **Circuit breakers**: each handler is guarded individually, so one
//!   failing consumer cannot stall the rest
//! - **Backpressure**: queues are bounded and publish never blocks; a
//!   full queue rejects the event instead
//! - **Dead-letter queue**: failed at-least-once events are retained and
//!   can be replayed through the normal publish path
//! - **Durability sinks**: published events can be appended to an
//!   in-memory or JSONL sink before dispatch
//!
//! # Example
//!
//! ```ignore
//! use caravan_bus::{Event, EventHandler, HandlerResult, HybridEventBus};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Projector;
//!
//! #[async_trait]
//! impl EventHandler for Projector {
//!     fn name(&self) -> &str {
//!         "projector"
//!     }
//!
//!     async fn handle(&self, event: &Event) -> HandlerResult {
//!         println!("applying {}", event.event_type());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), caravan_bus::Error> {
//!     let bus = HybridEventBus::builder().build();
//!     bus.subscribe(Arc::new(Projector)).await;
//!     bus.start().await?;
//!
//!     let event = Event::builder("order.placed")
//!         .aggregate("order-42", "order")
//!         .publisher("checkout")
//!         .build()?;
//!     assert!(bus.publish(event).await?);
//!
//!     let report = bus.stop(Duration::from_secs(5)).await?;
//!     assert!(report.is_clean());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod breaker;
pub mod bus;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod handler;
pub mod metrics;
pub mod queue;
pub mod sink;
pub mod types;

// Re-export main types
pub use breaker::{BreakerState, CircuitBreaker};
pub use bus::{BusBuilder, BusConfig, BusState, HybridEventBus};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, DeadLetterStats, CIRCUIT_OPEN_REASON};
pub use error::{Error, HandlerError, HandlerResult, Result};
pub use event::{Event, EventBuilder, EventMetadata};
pub use handler::{EventFilter, EventHandler, TypedEventHandler};
pub use metrics::{BusMetrics, HandlerSnapshot, ShutdownReport};
pub use queue::AggregateQueue;
pub use sink::{EventSink, InMemorySink, JsonlSink, TracingSink};
pub use types::{AggregateId, DeliveryMode, EventId, EventPriority};
