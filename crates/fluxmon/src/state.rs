// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared monitor state.
//!
//! The single mutable nucleus of the orchestrator. Only the poll task
//! mutates it; status readers (the health server, shutdown reporting)
//! take by-value snapshots through the same lock. No caller holds a
//! reference into the state across blocking work.
//!
//! Invariants, checked by the transition methods:
//! - `degraded == (consecutive_source_errors >= error_threshold)`
//! - `backoff_factor == 1` whenever not degraded
//! - `backoff_factor` never decreases while degraded, resets to 1 on the
//!   first successful fetch

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::RwLock;

/// What happened to the degraded-mode state machine on a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTransition {
    /// Below the error threshold; failure counted silently.
    None,
    /// This failure crossed the threshold; degraded mode entered.
    EnteredDegraded { consecutive_errors: u32 },
    /// Already degraded; the backoff factor grew (or stayed at cap).
    Backoff { factor: u32 },
}

/// Read-only snapshot of the monitor state, safe to hand to concurrent
/// observers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub sink_healthy: bool,
    pub degraded: bool,
    pub backoff_factor: u32,
    pub consecutive_source_errors: u32,
    pub cached_count: usize,
    pub last_poll_time: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    consecutive_source_errors: u32,
    degraded: bool,
    backoff_factor: u32,
    sink_healthy: bool,
    last_poll_time: DateTime<Utc>,
}

/// Monitor state behind a readers-writer lock.
#[derive(Debug)]
pub struct MonitorState {
    error_threshold: u32,
    max_backoff_factor: u32,
    inner: RwLock<Inner>,
}

impl MonitorState {
    pub fn new(
        error_threshold: u32,
        max_backoff_factor: u32,
        sink_healthy: bool,
        last_poll_time: DateTime<Utc>,
    ) -> Self {
        Self {
            error_threshold,
            max_backoff_factor,
            inner: RwLock::new(Inner {
                consecutive_source_errors: 0,
                degraded: false,
                backoff_factor: 1,
                sink_healthy,
                last_poll_time,
            }),
        }
    }

    /// Count a fetch failure and apply the degraded-mode transition.
    pub fn record_fetch_failure(&self) -> FailureTransition {
        let mut inner = self.write();
        inner.consecutive_source_errors += 1;

        if inner.consecutive_source_errors < self.error_threshold {
            return FailureTransition::None;
        }

        if !inner.degraded {
            inner.degraded = true;
            inner.backoff_factor = 2;
            FailureTransition::EnteredDegraded {
                consecutive_errors: inner.consecutive_source_errors,
            }
        } else {
            inner.backoff_factor = (inner.backoff_factor + 1).min(self.max_backoff_factor);
            FailureTransition::Backoff {
                factor: inner.backoff_factor,
            }
        }
    }

    /// Reset to baseline after a successful fetch. Returns true when this
    /// call left degraded mode (the caller emits the recovery
    /// notification exactly once).
    pub fn record_fetch_success(&self) -> bool {
        let mut inner = self.write();
        let was_degraded = inner.degraded;
        inner.consecutive_source_errors = 0;
        inner.degraded = false;
        inner.backoff_factor = 1;
        was_degraded
    }

    /// Current poll-interval multiplier (1 = baseline).
    pub fn backoff_factor(&self) -> u32 {
        self.read().backoff_factor
    }

    pub fn sink_healthy(&self) -> bool {
        self.read().sink_healthy
    }

    pub fn set_sink_healthy(&self, healthy: bool) {
        self.write().sink_healthy = healthy;
    }

    pub fn last_poll_time(&self) -> DateTime<Utc> {
        self.read().last_poll_time
    }

    pub fn set_last_poll_time(&self, t: DateTime<Utc>) {
        self.write().last_poll_time = t;
    }

    /// By-value snapshot; `cached_count` is supplied by the caller since
    /// the cache lives outside this lock.
    pub fn snapshot(&self, cached_count: usize) -> StatusSnapshot {
        let inner = self.read();
        StatusSnapshot {
            sink_healthy: inner.sink_healthy,
            degraded: inner.degraded,
            backoff_factor: inner.backoff_factor,
            consecutive_source_errors: inner.consecutive_source_errors,
            cached_count,
            last_poll_time: inner.last_poll_time,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
