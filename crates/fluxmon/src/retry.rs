// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Exponential-backoff retry for calls to external services.
//!
//! Retry governs the internal attempts of a single logical call; whether a
//! logical call is attempted at all is the circuit breaker's job (see
//! [`crate::breaker`]). A permanent error short-circuits the loop
//! immediately: retrying a rejected credential only burns the elapsed-time
//! budget.
//!
//! Callers that need a hard deadline wrap the returned future in
//! `tokio::time::timeout`; cancellation lands on the sleep between
//! attempts, so an expired deadline stops the loop early.

use std::time::{Duration, Instant};

/// Error classification consumed by the retry loop and breaker.
pub trait ErrorClass {
    /// A permanent error will not succeed on retry (bad credentials,
    /// malformed request). A transient one might (timeout, 5xx).
    fn is_permanent(&self) -> bool;
}

/// Exponential backoff policy for one retryable operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,

    /// Ceiling on the per-attempt delay.
    pub max_delay: Duration,

    /// Total budget; once exceeded the last error is returned to the
    /// caller.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy with a custom elapsed-time budget, other knobs default.
    pub fn with_max_elapsed(max_elapsed: Duration) -> Self {
        Self {
            max_elapsed,
            ..Self::default()
        }
    }

    /// Run `op` until it succeeds, returns a permanent error, or the
    /// elapsed-time budget is spent. The last error is returned verbatim.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: ErrorClass,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut delay = self.initial_delay;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_permanent() => return Err(err),
                Err(err) => {
                    // Give up when waiting again would exceed the budget.
                    if started.elapsed() + delay >= self.max_elapsed {
                        return Err(err);
                    }
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay.mul_f64(self.multiplier), self.max_delay);
                }
            }
        }
    }
}
