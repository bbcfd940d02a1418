// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Bounded retry for storage bring-up
//!
//! Storage that is not ready at boot is retried a fixed number of times with
//! a growing delay, then reported as unavailable. Nothing here spins forever.

use std::future::Future;
use std::time::Duration;

/// Exponential backoff between attempts, capped at `max_delay`
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
}

impl Backoff {
    /// Double from `initial_delay`, never waiting more than 30 s at once
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (0-indexed), None once exhausted
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Some(Duration::from_millis(delay_ms as u64).min(self.max_delay))
    }
}

/// Retry outcome with the number of attempts made
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    /// The value or the last error
    pub value: T,
    /// Number of attempts made, including the first
    pub attempts: u32,
}

/// Run an async operation, sleeping between failed attempts
///
/// `on_failure` sees each error and the attempt number before the next delay
/// (or before giving up).
///
/// # Example
///
/// ```
/// use pulsemeter::recovery::{Backoff, with_retry_async};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let backoff = Backoff::exponential(3, Duration::from_millis(1));
/// let result = with_retry_async(&backoff, || async { Ok::<_, &str>(42) }, |_, _| {}).await;
/// assert_eq!(result.unwrap().value, 42);
/// # }
/// ```
pub async fn with_retry_async<T, E, F, Fut, L>(
    backoff: &Backoff,
    mut operation: F,
    mut on_failure: L,
) -> Result<Attempted<T>, Attempted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    L: FnMut(&E, u32),
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt + 1,
                })
            }
            Err(e) => {
                on_failure(&e, attempt + 1);
                match backoff.delay_for_attempt(attempt) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        return Err(Attempted {
                            value: e,
                            attempts: attempt + 1,
                        })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let backoff = Backoff::exponential(4, Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(0), Some(Duration::from_secs(1)));
        assert_eq!(backoff.delay_for_attempt(1), Some(Duration::from_secs(2)));
        assert_eq!(backoff.delay_for_attempt(2), Some(Duration::from_secs(4)));
        assert_eq!(backoff.delay_for_attempt(3), Some(Duration::from_secs(8)));
        assert_eq!(backoff.delay_for_attempt(4), None);
    }

    #[test]
    fn test_delay_capped() {
        let backoff = Backoff {
            max_delay: Duration::from_millis(500),
            ..Backoff::exponential(10, Duration::from_millis(100))
        };
        assert_eq!(backoff.delay_for_attempt(2), Some(Duration::from_millis(400)));
        assert_eq!(backoff.delay_for_attempt(3), Some(Duration::from_millis(500)));
        assert_eq!(backoff.delay_for_attempt(9), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_no_retries() {
        let backoff = Backoff::exponential(0, Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_eventual_success() {
        let backoff = Backoff::exponential(5, Duration::from_millis(100));
        let mut calls = 0;
        let mut failures = Vec::new();
        let started = tokio::time::Instant::now();
        let result = with_retry_async(
            &backoff,
            || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Err("not mounted")
                    } else {
                        Ok(n)
                    }
                }
            },
            |_, attempt| failures.push(attempt),
        )
        .await;

        let done = result.unwrap();
        assert_eq!(done.value, 3);
        assert_eq!(done.attempts, 3);
        assert_eq!(failures, vec![1, 2]);
        // 100 ms then 200 ms
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let backoff = Backoff::exponential(2, Duration::from_secs(1));
        let result = with_retry_async(
            &backoff,
            || async { Err::<(), _>("always fails") },
            |_, _| {},
        )
        .await;

        let failed = result.unwrap_err();
        assert_eq!(failed.value, "always fails");
        assert_eq!(failed.attempts, 3);
    }
}
