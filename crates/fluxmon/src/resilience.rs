// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Retry + circuit-breaker composition for one downstream.
//!
//! A [`Guard`] owns both primitives for a single external dependency and
//! keeps them orthogonal: the breaker decides whether a logical call is
//! attempted at all; the retry policy governs the attempts inside one
//! admitted call. The breaker sees one outcome per logical call, not one
//! per attempt.
//!
//! The guard never caches data or changes poll cadence; what to do with a
//! failed call (cache the batch, enter degraded mode) is the caller's
//! decision.

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::retry::{ErrorClass, RetryPolicy};

/// Outcome of a guarded call.
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The breaker refused the call without attempting it.
    #[error("circuit breaker '{0}' is open")]
    Rejected(String),

    /// The call was attempted and failed; the downstream error is
    /// returned verbatim after retries were exhausted (or skipped, for a
    /// permanent error).
    #[error(transparent)]
    Failed(E),
}

impl<E> CallError<E> {
    /// The downstream error, if the call got that far.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Rejected(_) => None,
            CallError::Failed(e) => Some(e),
        }
    }
}

impl<E: ErrorClass> ErrorClass for CallError<E> {
    fn is_permanent(&self) -> bool {
        match self {
            // An open breaker clears on its own; never a permanent error.
            CallError::Rejected(_) => false,
            CallError::Failed(e) => e.is_permanent(),
        }
    }
}

/// Retry + breaker wrapper for one downstream.
pub struct Guard {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl Guard {
    pub fn new(name: impl Into<String>, retry: RetryPolicy, breaker: BreakerConfig) -> Self {
        Self {
            retry,
            breaker: CircuitBreaker::new(name, breaker),
        }
    }

    /// Current breaker state, for status reporting.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Place one logical call: fail fast if the breaker is open,
    /// otherwise run `op` under the retry policy and report the final
    /// outcome to the breaker.
    pub async fn call<T, E, F, Fut>(&self, mut op: F) -> Result<T, CallError<E>>
    where
        E: ErrorClass,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let ticket = self
            .breaker
            .try_acquire()
            .map_err(|open| CallError::Rejected(open.name))?;

        let result = self.retry.run(|| op()).await;
        self.breaker.record(ticket, result.is_ok());
        result.map_err(CallError::Failed)
    }

    /// One attempt, no retries, still gated and counted by the breaker.
    /// Used where the caller runs its own probe cadence.
    pub async fn call_once<T, E, F, Fut>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let ticket = self
            .breaker
            .try_acquire()
            .map_err(|open| CallError::Rejected(open.name))?;

        let result = op().await;
        self.breaker.record(ticket, result.is_ok());
        result.map_err(CallError::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("boom (permanent: {permanent})")]
    struct TestError {
        permanent: bool,
    }

    impl ErrorClass for TestError {
        fn is_permanent(&self) -> bool {
            self.permanent
        }
    }

    fn guard() -> Guard {
        Guard::new(
            "test",
            RetryPolicy {
                initial_delay: Duration::from_millis(1),
                multiplier: 2.0,
                max_delay: Duration::from_millis(2),
                max_elapsed: Duration::from_millis(10),
            },
            BreakerConfig {
                min_requests: 2,
                failure_ratio: 0.5,
                interval: Duration::from_secs(60),
                cooldown: Duration::from_secs(60),
                trial_calls: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_breaker_counts_logical_calls_not_attempts() {
        let g = guard();
        let attempts = AtomicU32::new(0);

        // One logical call with several internal retries.
        let result: Result<(), _> = g
            .call(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { permanent: false }) }
            })
            .await;
        assert!(result.is_err());
        assert!(attempts.load(Ordering::SeqCst) > 1, "retries happened");

        // One failed logical call of one request: below min_requests,
        // breaker still closed.
        assert_eq!(g.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_attempting() {
        let g = guard();
        for _ in 0..2 {
            let _ = g
                .call(|| async { Err::<(), _>(TestError { permanent: true }) })
                .await;
        }
        assert_eq!(g.breaker_state(), BreakerState::Open);

        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = g
            .call(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), TestError>(()) }
            })
            .await;
        assert!(matches!(result, Err(CallError::Rejected(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_is_returned_verbatim() {
        let g = guard();
        let result: Result<(), _> = g
            .call(|| async { Err(TestError { permanent: true }) })
            .await;
        match result {
            Err(CallError::Failed(e)) => assert!(e.permanent),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
