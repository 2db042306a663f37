//! Durability sink boundary.
//!
//! The bus can append every accepted event to a sink before dispatch, for
//! crash forensics and replay tooling. Dispatch correctness never depends on
//! a sink being present; it is an enhancement, not a dependency.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::types::AggregateId;

/// Trait for durability backends.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Durably record an accepted event.
    async fn append(&self, event: &Event) -> Result<()>;
}

/// In-memory journal, for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemorySink {
    events: RwLock<Vec<Event>>,
}

impl InMemorySink {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty journal wrapped in an `Arc`.
    #[must_use]
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of journaled events.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// True when nothing has been journaled.
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Snapshot of all journaled events, in append order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    /// Snapshot of the journaled events for one aggregate, in append order.
    pub async fn events_for_aggregate(&self, aggregate_id: &AggregateId) -> Vec<Event> {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| event.aggregate_id() == aggregate_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for InMemorySink {
    async fn append(&self, event: &Event) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

/// Append-only JSON-lines journal on disk: one serialized event per line.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlSink {
    /// Open (creating if needed) a journal file in append mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SinkFailed`] if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| Error::sink_failed(format!("open {}: {err}", path.display())))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a journal back into events, in append order. Blank lines are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SinkFailed`] if the file cannot be read, or
    /// [`Error::Serialization`] for a malformed line.
    pub async fn load(path: impl AsRef<Path>) -> Result<Vec<Event>> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| Error::sink_failed(format!("read {}: {err}", path.display())))?;
        let events = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<Vec<Event>, _>>()?;
        Ok(events)
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    async fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|err| Error::sink_failed(format!("write {}: {err}", self.path.display())))?;
        file.flush()
            .await
            .map_err(|err| Error::sink_failed(format!("flush {}: {err}", self.path.display())))?;
        Ok(())
    }
}

/// Decorator adding structured logs around an inner sink.
#[derive(Debug)]
pub struct TracingSink<S: EventSink> {
    inner: S,
}

impl<S: EventSink> TracingSink<S> {
    /// Wrap a sink with tracing.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// The wrapped sink.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: EventSink> EventSink for TracingSink<S> {
    async fn append(&self, event: &Event) -> Result<()> {
        debug!(
            event_id = %event.event_id(),
            event_type = event.event_type(),
            aggregate_id = %event.aggregate_id(),
            "appending event to sink"
        );
        let result = self.inner.append(event).await;
        match &result {
            Ok(()) => trace!(event_id = %event.event_id(), "event appended"),
            Err(err) => debug!(event_id = %event.event_id(), error = %err, "sink append failed"),
        }
        result
    }
}
