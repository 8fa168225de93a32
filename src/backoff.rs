//! Reconnect delay policies.

use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;

/// Exponential backoff: 1s, 2s, 4s, ... capped at 60s by default.
///
/// Wraps a `tokio_retry` strategy; resetting rebuilds the iterator.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    strategy: ExponentialBackoff,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    /// `initial` is rounded down to an even number of milliseconds, 2 ms at least.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            strategy: strategy(initial, max),
            attempt: 0,
        }
    }

    /// Delay before the next attempt; each call doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        // The strategy never ends; fall back to the cap all the same.
        self.strategy.next().unwrap_or(self.max).min(self.max)
    }

    /// Called after a successful connect.
    pub fn reset(&mut self) {
        self.strategy = strategy(self.initial, self.max);
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Base 2 yields 2, 4, 8 ... ms; the factor scales the first step to `initial`.
fn strategy(initial: Duration, max: Duration) -> ExponentialBackoff {
    let initial_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX);
    ExponentialBackoff::from_millis(2)
        .factor((initial_ms / 2).max(1))
        .max_delay(max)
}

/// Reconnect policy for a consumer loop.
#[derive(Debug, Clone)]
pub enum ReconnectPolicy {
    Exponential(Backoff),
    Fixed(Duration),
}

impl ReconnectPolicy {
    pub fn next_delay(&mut self) -> Duration {
        match self {
            ReconnectPolicy::Exponential(b) => b.next_delay(),
            ReconnectPolicy::Fixed(d) => *d,
        }
    }

    pub fn reset(&mut self) {
        if let ReconnectPolicy::Exponential(b) = self {
            b.reset();
        }
    }
}
