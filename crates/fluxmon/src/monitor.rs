// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The polling orchestrator.
//!
//! One long-lived task runs the poll loop: each tick executes exactly one
//! fetch-and-route cycle, then re-arms its timer at
//! `poll_interval * backoff_factor` using the factor observed after the
//! cycle. A second task runs cache retention. Everything else (sink
//! probes, cache drains, notifications) happens synchronously inside the
//! poll cycle, which keeps the routing protocol single-threaded:
//! cycle *n+1* never starts before cycle *n*'s cache push or sink write
//! has fully resolved.
//!
//! # Failure routing
//!
//! Fetch failures feed the degraded-mode state machine and never touch
//! the sink path. Fetched batches route on sink health: healthy, write
//! through (falling back to the cache on failure); unhealthy, cache
//! directly and probe for recovery. A recovered sink first drains the
//! cache; it is reported healthy only after a clean drain, so a crash or
//! failure mid-drain repeats writes instead of losing them.

use crate::breaker::BreakerConfig;
use crate::cache::DurableCache;
use crate::config::Config;
use crate::measurement::{Measurement, PollWindow};
use crate::notify::{Notifier, Severity};
use crate::redact::redact;
use crate::resilience::{CallError, Guard};
use crate::retry::RetryPolicy;
use crate::sink::{SinkError, TimeSeriesSink};
use crate::source::TelemetrySource;
use crate::state::{FailureTransition, MonitorState, StatusSnapshot};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub struct Monitor<S, K, N> {
    config: Config,
    source: S,
    sink: K,
    notifier: N,
    cache: Arc<DurableCache>,
    state: Arc<MonitorState>,
    source_guard: Guard,
    write_guard: Guard,
    probe_guard: Guard,
    notify_guard: Guard,
}

impl<S, K, N> Monitor<S, K, N>
where
    S: TelemetrySource,
    K: TimeSeriesSink,
    N: Notifier,
{
    /// Build a monitor. `sink_healthy` is the startup reachability
    /// verdict from `main`; the first poll window reaches back one
    /// interval so no data is missed across a restart.
    pub fn new(
        config: Config,
        source: S,
        sink: K,
        notifier: N,
        cache: Arc<DurableCache>,
        sink_healthy: bool,
    ) -> Self {
        let first_poll_start = Utc::now()
            - chrono::Duration::from_std(config.poll_interval())
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let state = Arc::new(MonitorState::new(
            config.error_threshold,
            config.max_backoff_factor,
            sink_healthy,
            first_poll_start,
        ));

        let retry = |max_elapsed: Duration| RetryPolicy {
            initial_delay: config.resilience.retry_initial(),
            multiplier: config.resilience.retry_multiplier,
            max_delay: config.resilience.retry_max_delay(),
            max_elapsed,
        };
        let breaker = || BreakerConfig {
            min_requests: config.resilience.breaker_min_requests,
            failure_ratio: config.resilience.breaker_failure_ratio,
            interval: config.resilience.breaker_interval(),
            cooldown: config.resilience.breaker_cooldown(),
            trial_calls: config.resilience.breaker_trial_calls,
        };

        let source_guard = Guard::new("source", retry(config.poll_timeout()), breaker());
        let write_guard = Guard::new("sink-write", retry(config.write_timeout()), breaker());
        let probe_guard = Guard::new("sink-probe", retry(config.probe_max_elapsed()), breaker());
        let notify_guard = Guard::new("notifier", retry(Duration::from_secs(5)), breaker());

        Self {
            config,
            source,
            sink,
            notifier,
            cache,
            state,
            source_guard,
            write_guard,
            probe_guard,
            notify_guard,
        }
    }

    /// Shared state handle for status readers.
    pub fn state(&self) -> Arc<MonitorState> {
        Arc::clone(&self.state)
    }

    /// Read-only status, safe to call concurrently with the poll loop.
    pub fn status(&self) -> StatusSnapshot {
        self.state.snapshot(self.cache.count())
    }

    /// Run the poll loop until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.poll_interval_secs,
            error_threshold = self.config.error_threshold,
            max_backoff_factor = self.config.max_backoff_factor,
            "poll loop started"
        );

        // Measurements cached before a restart drain as soon as possible.
        if self.state.sink_healthy() && self.cache.count() > 0 {
            tracing::info!(count = self.cache.count(), "draining cache left over from previous run");
            self.resync().await;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            // The factor read here is the value observed right after the
            // previous cycle; no separate timer-adjustment path exists.
            let period = self.config.poll_interval() * self.state.backoff_factor();
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(period) => {
                    let budget = self.cycle_budget();
                    if tokio::time::timeout(budget, self.poll_cycle()).await.is_err() {
                        tracing::error!(budget_secs = budget.as_secs(), "poll cycle exceeded its budget and was aborted");
                    }
                }
            }
        }

        tracing::info!("poll loop stopped");
    }

    /// Run the cache-retention janitor until the shutdown signal flips.
    /// Deletes snapshot generations past their retention age regardless
    /// of cache state.
    pub async fn run_cache_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        self.cleanup_cache().await;

        let mut interval = tokio::time::interval(self.config.cache_cleanup_interval());
        interval.tick().await; // immediate first tick already handled above

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => self.cleanup_cache().await,
            }
        }

        tracing::info!("cache cleanup task stopped");
    }

    /// Execute one poll-and-route cycle.
    pub async fn poll_cycle(&self) {
        let now = Utc::now();
        let window = match PollWindow::new(self.state.last_poll_time(), now) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "refusing to poll an invalid window");
                return;
            }
        };

        tracing::info!(start = %window.start, end = %window.end, "polling telemetry");

        let fetched = self
            .source_guard
            .call(|| {
                timed(self.config.poll_timeout(), self.source.fetch(&window), || {
                    crate::source::SourceError::Transport("fetch deadline exceeded".to_string())
                })
            })
            .await;

        let batch = match fetched {
            Ok(batch) => batch,
            Err(err) => {
                self.on_fetch_failure(&err).await;
                return;
            }
        };

        if self.state.record_fetch_success() {
            tracing::info!("exiting degraded mode, resuming normal polling interval");
            self.alert(
                Severity::Info,
                "Telemetry source",
                "Recovered from degraded mode - resuming normal polling".to_string(),
            )
            .await;
        }
        self.state.set_last_poll_time(window.end);

        if batch.is_empty() {
            tracing::info!("no new telemetry available");
            return;
        }
        tracing::info!(count = batch.len(), "retrieved telemetry");

        // Out-of-band probe each cycle; a healthy sink that stopped
        // answering flips to cache mode before we attempt the write.
        self.check_sink_health().await;

        if self.state.sink_healthy() {
            match self.write_batch(&batch).await {
                Ok(()) => {
                    tracing::info!(count = batch.len(), "wrote measurements to sink");
                }
                Err(err) => {
                    let text = redact(&err.to_string());
                    tracing::error!(error = %text, "failed to write to sink");
                    self.state.set_sink_healthy(false);
                    self.alert(
                        Severity::Error,
                        "Sink",
                        format!("Failed to write data: {text}. Switching to cache mode."),
                    )
                    .await;
                    self.cache_batch(&batch).await;
                }
            }
        } else {
            self.cache_batch(&batch).await;
            self.try_reconnect_sink().await;
        }
    }

    async fn on_fetch_failure(&self, err: &CallError<crate::source::SourceError>) {
        let text = redact(&err.to_string());
        tracing::error!(error = %text, "error fetching telemetry");

        match self.state.record_fetch_failure() {
            FailureTransition::None => {}
            FailureTransition::EnteredDegraded { consecutive_errors } => {
                tracing::warn!(
                    consecutive_errors,
                    new_interval_secs = self.config.poll_interval_secs * 2,
                    "entering degraded mode"
                );
                self.alert(
                    Severity::Error,
                    "Telemetry source",
                    format!("Entering degraded mode after {consecutive_errors} consecutive errors: {text}"),
                )
                .await;
            }
            FailureTransition::Backoff { factor } => {
                tracing::warn!(
                    backoff_factor = factor,
                    new_interval_secs = self.config.poll_interval_secs * u64::from(factor),
                    "increasing backoff factor"
                );
            }
        }
    }

    /// Write a batch point by point. The first failure aborts the pass;
    /// the caller re-routes the whole batch to the cache, so a written
    /// prefix is simply re-delivered later.
    async fn write_batch(&self, batch: &[Measurement]) -> Result<(), CallError<SinkError>> {
        for point in batch {
            self.write_guard
                .call(|| {
                    timed(self.config.write_timeout(), self.sink.write_point(point), || {
                        SinkError::Transport("write deadline exceeded".to_string())
                    })
                })
                .await?;
        }
        self.sink.flush().await.map_err(CallError::Failed)?;
        Ok(())
    }

    /// Push a batch into the durable cache, whole. A persistence error
    /// is alerted but the data stays in memory, so nothing is lost yet.
    async fn cache_batch(&self, batch: &[Measurement]) {
        match self.cache.add(batch) {
            Ok(()) => {
                tracing::info!(
                    count = batch.len(),
                    total_cached = self.cache.count(),
                    "cached measurements"
                );
            }
            Err(e) => {
                let text = redact(&format!("{e:#}"));
                tracing::error!(error = %text, "failed to persist cache");
                self.alert(
                    Severity::Error,
                    "Cache",
                    format!("Failed to persist cached data: {text}"),
                )
                .await;
            }
        }
    }

    /// Single mid-cycle reachability probe.
    ///
    /// healthy -> unhealthy: flip and alert, nothing to resync.
    /// unhealthy -> reachable: drain the cache before accepting write
    /// traffic; the healthy flag flips inside [`resync`](Self::resync)
    /// only after a clean drain.
    async fn check_sink_health(&self) {
        let was_healthy = self.state.sink_healthy();
        let reachable = self
            .probe_guard
            .call_once(|| {
                timed(self.config.write_timeout(), self.sink.health_check(), || {
                    SinkError::Transport("health check deadline exceeded".to_string())
                })
            })
            .await
            .is_ok();

        if was_healthy && !reachable {
            tracing::warn!("sink connection lost");
            self.state.set_sink_healthy(false);
            self.alert(
                Severity::Error,
                "Sink",
                "Connection to sink lost. Switching to cache mode.".to_string(),
            )
            .await;
        } else if !was_healthy && reachable {
            tracing::info!("sink connection restored");
            self.alert(
                Severity::Info,
                "Sink",
                "Connection to sink restored. Draining cached data...".to_string(),
            )
            .await;
            self.resync().await;
        }
    }

    /// Bounded-retry reconnect probe, issued once per cycle while the
    /// sink is down.
    async fn try_reconnect_sink(&self) {
        let reachable = self
            .probe_guard
            .call(|| {
                timed(self.config.write_timeout(), self.sink.health_check(), || {
                    SinkError::Transport("health check deadline exceeded".to_string())
                })
            })
            .await;

        match reachable {
            Ok(()) => {
                tracing::info!("sink reachable again");
                self.alert(
                    Severity::Info,
                    "Sink",
                    "Connection to sink restored. Draining cached data...".to_string(),
                )
                .await;
                self.resync().await;
            }
            Err(e) => {
                tracing::debug!(error = %redact(&e.to_string()), "sink still unreachable");
            }
        }
    }

    /// Drain a snapshot of the cache to the sink, one point at a time,
    /// in order.
    ///
    /// The first failure aborts the drain and leaves the cache untouched;
    /// the already-written prefix is re-delivered on the next attempt
    /// (the sink dedups on timestamp+tags). Only a fully successful pass
    /// removes exactly the drained snapshot; entries cached concurrently
    /// stay. Returns whether the sink ended up healthy.
    pub async fn resync(&self) -> bool {
        let snapshot = self.cache.snapshot();
        if snapshot.is_empty() {
            tracing::info!("no cached data to drain");
            self.state.set_sink_healthy(true);
            return true;
        }

        tracing::info!(count = snapshot.len(), "draining cached measurements to sink");
        let deadline = Instant::now() + self.config.cache_sync_timeout();

        for (index, point) in snapshot.iter().enumerate() {
            if Instant::now() >= deadline {
                tracing::error!(written = index, total = snapshot.len(), "cache drain timed out");
                self.state.set_sink_healthy(false);
                self.alert(
                    Severity::Error,
                    "Cache drain",
                    format!("Drain timed out after {index} of {} points", snapshot.len()),
                )
                .await;
                return false;
            }

            let written = self
                .write_guard
                .call(|| {
                    timed(self.config.write_timeout(), self.sink.write_point(point), || {
                        SinkError::Transport("write deadline exceeded".to_string())
                    })
                })
                .await;

            if let Err(e) = written {
                let text = redact(&e.to_string());
                tracing::error!(written = index, total = snapshot.len(), error = %text, "cache drain aborted");
                self.state.set_sink_healthy(false);
                self.alert(
                    Severity::Error,
                    "Cache drain",
                    format!("Failed to drain cached data: {text}"),
                )
                .await;
                return false;
            }
        }

        if let Err(e) = self.sink.flush().await {
            let text = redact(&e.to_string());
            tracing::error!(error = %text, "cache drain flush failed");
            self.state.set_sink_healthy(false);
            self.alert(
                Severity::Error,
                "Cache drain",
                format!("Failed to flush drained data: {text}"),
            )
            .await;
            return false;
        }

        if let Err(e) = self.cache.remove_front(snapshot.len()) {
            // The sink already holds the data; stale cache entries are
            // re-delivered next drain, which the sink tolerates.
            let text = redact(&format!("{e:#}"));
            tracing::error!(error = %text, "failed to clear drained entries from cache");
            self.alert(
                Severity::Error,
                "Cache",
                format!("Failed to clear drained cache entries: {text}"),
            )
            .await;
        } else {
            tracing::info!(count = snapshot.len(), "drained cached measurements");
            self.alert(
                Severity::Info,
                "Cache drain",
                format!("Successfully drained {} cached measurements to the sink", snapshot.len()),
            )
            .await;
        }

        self.state.set_sink_healthy(true);
        true
    }

    async fn cleanup_cache(&self) {
        tracing::info!(
            retention_days = self.config.cache.retention_days,
            "running cache snapshot cleanup"
        );
        match self.cache.cleanup_old_snapshots(self.config.cache_retention()) {
            Ok(removed) => {
                tracing::info!(removed, "cache snapshot cleanup finished");
            }
            Err(e) => {
                let text = redact(&format!("{e:#}"));
                tracing::error!(error = %text, "cache snapshot cleanup failed");
                self.alert(
                    Severity::Warning,
                    "Cache cleanup",
                    format!("Failed to clean up old cache snapshots: {text}"),
                )
                .await;
            }
        }
    }

    /// Best-effort notification. Failures are logged and never change
    /// control flow; callers pre-redact any error text in `body`.
    pub async fn alert(&self, severity: Severity, title: &str, body: String) {
        if !self.config.notify.enabled {
            return;
        }
        let delivered = self
            .notify_guard
            .call(|| self.notifier.notify(severity, title, &body))
            .await;
        if let Err(e) = delivered {
            tracing::error!(error = %e, %severity, title, "failed to deliver notification");
        }
    }

    /// Everything a cycle can legitimately spend: fetch, probe retries,
    /// a write pass, and a full drain. Exceeding it means something is
    /// stuck, not slow.
    fn cycle_budget(&self) -> Duration {
        self.config.poll_timeout()
            + self.config.probe_max_elapsed()
            + self.config.write_timeout() * 2
            + self.config.cache_sync_timeout()
            + Duration::from_secs(10)
    }
}

async fn timed<T, E, F>(limit: Duration, fut: F, on_timeout: impl FnOnce() -> E) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}
