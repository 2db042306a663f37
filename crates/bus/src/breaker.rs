//! Per-handler circuit breaker.
//!
//! Isolates a consistently failing handler so it cannot stall the bus or
//! hammer a broken downstream dependency. One breaker per handler
//! registration; dispatch consults [`CircuitBreaker::allow_request`] before
//! every invocation.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Sentinel for "no failure recorded yet".
const NEVER: u64 = u64::MAX;

/// Observable breaker state, derived from the failure count and clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Failures below threshold; dispatch proceeds normally.
    Closed,
    /// Threshold reached and cooldown still running; dispatch is skipped.
    Open,
    /// Cooldown elapsed; the next dispatch is a trial attempt.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{label}")
    }
}

/// Failure tracker with closed/open/half-open semantics.
///
/// Lock-free: a failure counter plus the timestamp of the last failure,
/// measured in milliseconds against a monotonic origin taken at construction.
/// While open, requests are refused until `cooldown` has elapsed since the
/// last failure; after that every request is a trial until an outcome is
/// recorded — a success closes the breaker, a failure re-stamps the clock and
/// closes the trial window again.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    failure_count: AtomicU32,
    last_failure_ms: AtomicU64,
    origin: Instant,
}

impl CircuitBreaker {
    /// Create a breaker that opens once `failure_threshold` consecutive
    /// failures are recorded and re-admits trials after `cooldown`.
    ///
    /// A threshold of zero is treated as one; a breaker that never admits
    /// anything would be useless.
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            failure_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(NEVER),
            origin: Instant::now(),
        }
    }

    /// Record a successful invocation: resets the failure count and closes
    /// the breaker from open or trial.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        self.last_failure_ms.store(NEVER, Ordering::SeqCst);
    }

    /// Record a failed invocation and stamp the failure time. Reaching the
    /// threshold transitions closed to open.
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::SeqCst);
        self.last_failure_ms.store(self.elapsed_ms(), Ordering::SeqCst);
    }

    /// Whether dispatch may invoke the handler right now.
    ///
    /// `true` while closed; while open, `true` only once the cooldown has
    /// elapsed since the last recorded failure (a trial attempt).
    #[must_use]
    pub fn allow_request(&self) -> bool {
        let count = self.failure_count.load(Ordering::SeqCst);
        if count < self.failure_threshold {
            return true;
        }
        self.cooldown_elapsed()
    }

    /// Current observable state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let count = self.failure_count.load(Ordering::SeqCst);
        if count < self.failure_threshold {
            BreakerState::Closed
        } else if self.cooldown_elapsed() {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    /// Failures recorded since the last success.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// The configured opening threshold.
    #[must_use]
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    fn cooldown_elapsed(&self) -> bool {
        let last = self.last_failure_ms.load(Ordering::SeqCst);
        if last == NEVER {
            return true;
        }
        let cooldown_ms = u64::try_from(self.cooldown.as_millis()).unwrap_or(NEVER);
        self.elapsed_ms().saturating_sub(last) >= cooldown_ms
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(NEVER)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_closed_and_allows() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_request());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
        assert_eq!(breaker.failure_count(), 3);
    }

    #[test]
    fn test_success_resets_from_open() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_cooldown_admits_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(40));
        breaker.record_failure();
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_trial_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(40));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.allow_request());

        // The trial fails: the window closes again.
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_zero_threshold_clamped() {
        let breaker = CircuitBreaker::new(0, Duration::from_secs(1));
        assert_eq!(breaker.failure_threshold(), 1);
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(BreakerState::Closed.to_string(), "closed");
        assert_eq!(BreakerState::HalfOpen.to_string(), "half_open");
        let json = serde_json::to_string(&BreakerState::HalfOpen).unwrap();
        assert_eq!(json, "\"half_open\"");
    }
}
