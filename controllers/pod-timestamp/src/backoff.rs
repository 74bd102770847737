//! # Exponential Backoff
//!
//! Reconnect spacing for the pod watch. The base delay doubles on every
//! consecutive failure up to a ceiling, and each returned delay is jittered
//! into `[base/2, base]` so that many controllers losing the same API server
//! do not reconnect in lockstep.
//!
//! Default sequence (bases): 1s, 2s, 4s, 8s, 16s, 30s (max), 30s, ...

use rand::Rng;
use std::time::Duration;

/// Exponential backoff calculator
///
/// Holds the only mutable state of the watch loop besides the stream itself:
/// the current base delay and the number of consecutive failures. Both go
/// back to zero on `reset()`, which the watch loop calls for every event it
/// delivers.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay after a reset
    initial: Duration,
    /// Base delay the next call will use
    current: Duration,
    /// Ceiling for the base delay
    max: Duration,
    /// Consecutive failures since the last reset
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `initial` and capped at `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial.min(max),
            max,
            attempts: 0,
        }
    }

    /// Get the next un-jittered base delay and advance the sequence
    pub fn next_base(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        result
    }

    /// Get the next jittered delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        jitter(self.next_base())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
        self.attempts = 0;
    }

    /// Consecutive failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Spread `base` uniformly over `[base/2, base]`.
pub fn jitter(base: Duration) -> Duration {
    let half = base / 2;
    let span = u64::try_from((base - half).as_millis()).unwrap_or(u64::MAX);
    if span == 0 {
        return base;
    }
    half + Duration::from_millis(rand::rng().random_range(0..=span))
}
