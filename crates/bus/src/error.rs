//! Error types for the bus crate.

use thiserror::Error;

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Bus error types.
///
/// Backpressure is deliberately absent: a full aggregate queue is an in-band
/// `Ok(false)` from `publish`, not an error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Event construction rejected: a required identity field was missing or
    /// empty.
    #[error("invalid event: {reason}")]
    InvalidEvent { reason: String },

    /// A lifecycle operation was called in the wrong bus state.
    #[error("cannot {operation} while bus is {state}")]
    InvalidState { operation: String, state: String },

    /// The durability sink rejected an operation.
    #[error("event sink failed: {reason}")]
    SinkFailed { reason: String },

    /// Canonical or journal serialization failed.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },
}

impl Error {
    /// Create an invalid event error.
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(operation: impl Into<String>, state: impl Into<String>) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.into(),
        }
    }

    /// Create a sink failure error.
    pub fn sink_failed(reason: impl Into<String>) -> Self {
        Self::SinkFailed {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Failure signal returned by a handler's `handle()`.
///
/// The dispatcher records it against the handler's circuit breaker and, for
/// at-least-once events, uses the message as the dead-letter reason. It never
/// propagates to the publisher or to other handlers of the same event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error with the given failure message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Result type alias for handler invocations.
pub type HandlerResult = std::result::Result<(), HandlerError>;
