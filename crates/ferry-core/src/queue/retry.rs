//! Retry policy: decides between redelivery and dead-lettering.

use std::time::Duration;

/// What happens to an abandoned (or timed-out) item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to the ready queue, after `delay` if any.
    Requeue { delay: Option<Duration> },

    /// Retry budget exhausted.
    DeadLetter,
}

/// Retry policy for abandoned items.
///
/// The same decision applies to explicit abandons and to timeout-sweep abandons.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Redeliveries allowed after the first delivery.
    pub retries: u32,

    /// Delay before the first redelivery. `None` requeues immediately.
    pub base_delay: Option<Duration>,

    /// Backoff multiplier applied per attempt.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Decide the fate of an item that has been delivered `attempts` times.
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if attempts > self.retries {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Requeue {
                delay: self.next_delay(attempts),
            }
        }
    }

    /// Delay before redelivery: base_delay * multiplier^(attempts - 1)
    ///
    /// Example with base_delay=1s, multiplier=2.0:
    /// - after attempt 1: 1s
    /// - after attempt 2: 2s
    /// - after attempt 3: 4s
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        let base = self.base_delay?;
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = base.as_secs_f64() * self.multiplier.powi(exponent);
        Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }
}
