//! # Fibonacci Backoff
//!
//! Progressive retry delays for failed reconciles, tracked per object and
//! capped at a configured maximum.
//!
//! ```rust
//! use nim_operator::controller::backoff::FibonacciBackoff;
//!
//! let mut backoff = FibonacciBackoff::new(5, 60);
//! assert_eq!(backoff.next_backoff_seconds(), 5);
//! assert_eq!(backoff.next_backoff_seconds(), 5);
//! assert_eq!(backoff.next_backoff_seconds(), 10);
//! assert_eq!(backoff.next_backoff_seconds(), 15);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fibonacci backoff calculator in seconds, capped at a maximum
///
/// Each delay is the sum of the previous two; the first two are `min_secs`.
///
/// # Example
///
/// ```
/// use nim_operator::controller::backoff::FibonacciBackoff;
///
/// let mut backoff = FibonacciBackoff::new(5, 300);
/// println!("Backoff: {}s", backoff.next_backoff_seconds());
/// ```
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// First delay, restored by [`FibonacciBackoff::reset`]
    min_secs: u64,
    /// Previous delay
    prev_secs: u64,
    /// Delay returned by the next call
    current_secs: u64,
    /// Upper bound for every delay
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min_secs` and never exceeding `max_secs`.
    ///
    /// # Arguments
    ///
    /// * `min_secs` - First (and second) delay in seconds
    /// * `max_secs` - Cap for the sequence in seconds
    ///
    /// # Example
    ///
    /// ```
    /// use nim_operator::controller::backoff::FibonacciBackoff;
    ///
    /// let backoff = FibonacciBackoff::new(5, 300); // 5s, 5s, 10s, 15s, 25s, ... 300s
    /// ```
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Current delay in seconds; advances the sequence.
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_secs.min(self.max_secs);
        let next = self.prev_secs.saturating_add(self.current_secs);
        self.prev_secs = self.current_secs;
        self.current_secs = next.min(self.max_secs);
        result
    }

    /// Same as [`FibonacciBackoff::next_backoff_seconds`], as a `Duration`.
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Start the sequence over, e.g. after a successful reconcile.
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }
}

/// Backoff sequences tracked per object key (`controller/namespace/name`)
///
/// Each failing object backs off independently; a success resets only that
/// object's sequence.
#[derive(Debug, Clone)]
pub struct BackoffRegistry {
    /// Minimum backoff for a fresh key (seconds)
    min_secs: u64,
    /// Maximum backoff, also used when the lock is poisoned (seconds)
    max_secs: u64,
    /// Sequence per object key
    states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    /// Consecutive failures since the last reset
    error_count: u32,
}

impl BackoffRegistry {
    /// Create an empty registry; every key starts its own
    /// [`FibonacciBackoff`] with these bounds.
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            max_secs,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a failure for `key`; returns the delay and the consecutive error count.
    pub fn next_failure(&self, key: &str) -> (Duration, u32) {
        let Ok(mut states) = self.states.lock() else {
            return (Duration::from_secs(self.max_secs), 0);
        };
        let state = states.entry(key.to_string()).or_insert_with(|| BackoffState {
            backoff: FibonacciBackoff::new(self.min_secs, self.max_secs),
            error_count: 0,
        });
        state.error_count = state.error_count.saturating_add(1);
        (state.backoff.next_backoff(), state.error_count)
    }

    /// Forget the failure history of `key`.
    pub fn reset(&self, key: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(key);
        }
    }
}
