// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Circuit breaker for failing downstreams.
//!
//! Tracks a rolling request/failure count per downstream. Once enough
//! requests have been seen and the failure ratio crosses the threshold the
//! breaker opens: calls fail immediately without touching the downstream,
//! for a cooldown period. After the cooldown a limited number of trial
//! calls go through (half-open); success closes the breaker, failure
//! reopens it.
//!
//! ```text
//! Closed --[ratio >= threshold over >= min requests]--> Open
//! Open --[cooldown elapsed]--> HalfOpen
//! HalfOpen --[trial successes]--> Closed
//! HalfOpen --[any failure]--> Open
//! ```

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, requests flow through.
    Closed,
    /// Failing fast, requests rejected without calling the downstream.
    Open,
    /// Cooldown elapsed, limited trial traffic allowed.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Tuning for one breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Minimum requests in the rolling window before the ratio is judged.
    pub min_requests: u32,

    /// Failure ratio at or above which the breaker opens.
    pub failure_ratio: f64,

    /// Rolling window: closed-state counts reset on this cadence.
    pub interval: Duration,

    /// How long the breaker stays open before allowing trial calls.
    pub cooldown: Duration,

    /// Trial calls admitted while half-open; this many consecutive
    /// successes close the breaker.
    pub trial_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 3,
            failure_ratio: 0.6,
            interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            trial_calls: 3,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    requests: u32,
    failures: u32,
    consecutive_successes: u32,
}

struct Core {
    state: BreakerState,
    // Bumped on every state change and window roll; results reported
    // against a stale generation are dropped.
    generation: u64,
    counts: Counts,
    // Next state-relevant deadline: window roll (closed) or cooldown
    // expiry (open).
    deadline: Option<Instant>,
}

/// A call ticket handed out by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    generation: u64,
}

/// The breaker refused the call outright.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker '{name}' is open")]
pub struct BreakerOpen {
    pub name: String,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    core: Mutex<Core>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: config.clone(),
            core: Mutex::new(Core {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                deadline: Some(Instant::now() + config.interval),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, after applying any due timed transition.
    pub fn state(&self) -> BreakerState {
        let mut core = self.lock();
        self.refresh(&mut core, Instant::now());
        core.state
    }

    /// Ask to place one logical call. `Ok` admits the call and must be
    /// answered with [`record`](Self::record); `Err` means fail fast.
    pub fn try_acquire(&self) -> Result<Ticket, BreakerOpen> {
        let mut core = self.lock();
        let now = Instant::now();
        self.refresh(&mut core, now);

        match core.state {
            BreakerState::Open => Err(BreakerOpen {
                name: self.name.clone(),
            }),
            BreakerState::HalfOpen if core.counts.requests >= self.config.trial_calls => {
                Err(BreakerOpen {
                    name: self.name.clone(),
                })
            }
            _ => {
                core.counts.requests += 1;
                Ok(Ticket {
                    generation: core.generation,
                })
            }
        }
    }

    /// Report the outcome of an admitted call.
    pub fn record(&self, ticket: Ticket, success: bool) {
        let mut core = self.lock();
        let now = Instant::now();
        self.refresh(&mut core, now);

        // The breaker moved on (window rolled or state changed) while the
        // call was in flight; its outcome no longer applies.
        if ticket.generation != core.generation {
            return;
        }

        if success {
            core.counts.consecutive_successes += 1;
            if core.state == BreakerState::HalfOpen
                && core.counts.consecutive_successes >= self.config.trial_calls
            {
                self.transition(&mut core, BreakerState::Closed, now);
            }
        } else {
            core.counts.failures += 1;
            core.counts.consecutive_successes = 0;
            match core.state {
                BreakerState::HalfOpen => self.transition(&mut core, BreakerState::Open, now),
                BreakerState::Closed if self.ready_to_trip(&core.counts) => {
                    self.transition(&mut core, BreakerState::Open, now);
                }
                _ => {}
            }
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.config.min_requests
            && f64::from(counts.failures) / f64::from(counts.requests) >= self.config.failure_ratio
    }

    /// Apply timed transitions: cooldown expiry and closed-window rolls.
    fn refresh(&self, core: &mut Core, now: Instant) {
        let due = matches!(core.deadline, Some(d) if now >= d);
        if !due {
            return;
        }
        match core.state {
            BreakerState::Open => self.transition(core, BreakerState::HalfOpen, now),
            BreakerState::Closed => {
                // Roll the counting window; state does not change.
                core.generation += 1;
                core.counts = Counts::default();
                core.deadline = Some(now + self.config.interval);
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, core: &mut Core, to: BreakerState, now: Instant) {
        let from = core.state;
        if from == to {
            return;
        }
        core.state = to;
        core.generation += 1;
        core.counts = Counts::default();
        core.deadline = match to {
            BreakerState::Closed => Some(now + self.config.interval),
            BreakerState::Open => Some(now + self.config.cooldown),
            BreakerState::HalfOpen => None,
        };
        match to {
            BreakerState::Open => {
                tracing::warn!(breaker = %self.name, %from, "circuit breaker opened")
            }
            _ => tracing::info!(breaker = %self.name, %from, %to, "circuit breaker state change"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Core> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            min_requests: 3,
            failure_ratio: 0.6,
            interval: Duration::from_secs(60),
            cooldown: Duration::from_millis(20),
            trial_calls: 2,
        }
    }

    fn fail_once(b: &CircuitBreaker) {
        let ticket = b.try_acquire().expect("call admitted");
        b.record(ticket, false);
    }

    fn succeed_once(b: &CircuitBreaker) {
        let ticket = b.try_acquire().expect("call admitted");
        b.record(ticket, true);
    }

    #[test]
    fn test_stays_closed_below_min_requests() {
        let b = CircuitBreaker::new("test", quick_config());
        fail_once(&b);
        fail_once(&b);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_opens_at_failure_ratio() {
        let b = CircuitBreaker::new("test", quick_config());
        fail_once(&b);
        fail_once(&b);
        fail_once(&b);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err(), "open breaker fails fast");
    }

    #[test]
    fn test_mixed_outcomes_below_ratio_stay_closed() {
        let b = CircuitBreaker::new("test", quick_config());
        succeed_once(&b);
        succeed_once(&b);
        fail_once(&b);
        // 1 failure of 3 requests is below the 0.6 ratio.
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes() {
        let b = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            fail_once(&b);
        }
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(b.state(), BreakerState::HalfOpen);

        succeed_once(&b);
        succeed_once(&b);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            fail_once(&b);
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(b.state(), BreakerState::HalfOpen);

        fail_once(&b);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn test_half_open_limits_trial_calls() {
        let b = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            fail_once(&b);
        }
        std::thread::sleep(Duration::from_millis(25));

        // trial_calls = 2: two tickets admitted, the third refused.
        let t1 = b.try_acquire().unwrap();
        let _t2 = b.try_acquire().unwrap();
        assert!(b.try_acquire().is_err());
        b.record(t1, true);
    }

    #[test]
    fn test_stale_generation_result_is_dropped() {
        let b = CircuitBreaker::new("test", quick_config());
        let stale = b.try_acquire().unwrap();
        // Two failures on top of the in-flight ticket trip the breaker
        // (3 requests seen, 2 failures, ratio 0.67).
        fail_once(&b);
        fail_once(&b);
        assert_eq!(b.state(), BreakerState::Open);
        // Outcome from before the trip must not disturb the open state.
        b.record(stale, true);
        assert_eq!(b.state(), BreakerState::Open);
    }
}
