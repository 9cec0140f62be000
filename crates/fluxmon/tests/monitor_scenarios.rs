// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end monitor scenarios against mock adapters.
//!
//! Each test drives full poll cycles through the public API and asserts
//! on the externally observable contract: what reached the sink, what
//! sits in the cache, and what the status surface reports.

use chrono::{TimeZone, Utc};
use fluxmon::notify::{RecordingNotifier, Severity};
use fluxmon::sink::MockSink;
use fluxmon::source::{MockSource, SourceError};
use fluxmon::{Config, DurableCache, Measurement, Monitor};
use std::sync::Arc;

type TestMonitor = Monitor<Arc<MockSource>, Arc<MockSink>, Arc<RecordingNotifier>>;

struct Rig {
    monitor: TestMonitor,
    source: Arc<MockSource>,
    sink: Arc<MockSink>,
    notifier: Arc<RecordingNotifier>,
    cache: Arc<DurableCache>,
    _dir: tempfile::TempDir,
}

fn rig(sink_healthy: bool) -> Rig {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.cache.dir = dir.path().join("cache").display().to_string();
    config.notify.enabled = true;
    config.notify.webhook_url = "https://hooks.example.com/test".to_string();
    // Millisecond retries and an effectively disabled breaker keep the
    // failure-path scenarios fast and deterministic; breaker behavior
    // has its own unit tests.
    config.poll_timeout_secs = 2;
    config.write_timeout_secs = 1;
    config.probe_max_elapsed_secs = 0;
    config.resilience.retry_initial_ms = 1;
    config.resilience.retry_max_delay_ms = 2;
    config.resilience.breaker_min_requests = 10_000;

    let source = Arc::new(MockSource::new());
    let sink = Arc::new(MockSink::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let cache = Arc::new(DurableCache::open(&config.cache.dir).unwrap());

    let monitor = Monitor::new(
        config,
        Arc::clone(&source),
        Arc::clone(&sink),
        Arc::clone(&notifier),
        Arc::clone(&cache),
        sink_healthy,
    );

    Rig {
        monitor,
        source,
        sink,
        notifier,
        cache,
        _dir: dir,
    }
}

fn batch(base_secs: i64, n: usize) -> Vec<Measurement> {
    (0..n)
        .map(|i| {
            Measurement::new(
                Utc.timestamp_opt(base_secs + i as i64 * 10, 0).unwrap(),
                [
                    ("consumption_delta", 0.05 * (i as f64 + 1.0)),
                    ("demand", 180.0 + i as f64),
                ],
            )
        })
        .collect()
}

/// Scenario A: three consecutive fetch failures enter degraded mode with
/// factor 2, a fourth grows it to 3, one success resets everything.
#[tokio::test]
async fn scenario_a_degraded_entry_growth_and_recovery() {
    let rig = rig(true);

    for _ in 0..2 {
        rig.source.push_error(SourceError::Rejected("boom".into()));
        rig.monitor.poll_cycle().await;
    }
    let status = rig.monitor.status();
    assert!(!status.degraded, "below threshold after 2 failures");
    assert_eq!(status.backoff_factor, 1);

    rig.source.push_error(SourceError::Rejected("boom".into()));
    rig.monitor.poll_cycle().await;
    let status = rig.monitor.status();
    assert!(status.degraded);
    assert_eq!(status.backoff_factor, 2);

    rig.source.push_error(SourceError::Rejected("boom".into()));
    rig.monitor.poll_cycle().await;
    assert_eq!(rig.monitor.status().backoff_factor, 3);

    rig.source.push_batch(batch(0, 1));
    rig.monitor.poll_cycle().await;
    let status = rig.monitor.status();
    assert!(!status.degraded);
    assert_eq!(status.backoff_factor, 1);
    assert_eq!(status.consecutive_source_errors, 0);

    // Exactly one degraded alert and one recovery notification.
    let sent = rig.notifier.sent();
    assert_eq!(
        sent.iter()
            .filter(|(s, _, b)| *s == Severity::Error && b.contains("degraded mode"))
            .count(),
        1
    );
    assert_eq!(
        sent.iter()
            .filter(|(s, _, b)| *s == Severity::Info && b.contains("Recovered"))
            .count(),
        1
    );
}

/// Backoff growth is additive and capped at the configured maximum.
#[tokio::test]
async fn backoff_factor_caps_at_maximum() {
    let rig = rig(true);

    for _ in 0..8 {
        rig.source.push_error(SourceError::Rejected("boom".into()));
        rig.monitor.poll_cycle().await;
    }

    let status = rig.monitor.status();
    assert!(status.degraded);
    assert_eq!(status.backoff_factor, 4, "default cap");
}

/// Scenario B: write failures divert whole batches to the cache and the
/// cache grows across cycles while the sink stays down.
#[tokio::test]
async fn scenario_b_sink_outage_accumulates_cache() {
    let rig = rig(true);
    rig.sink.reject_writes();
    rig.sink.set_healthy(false);

    rig.source.push_batch(batch(0, 5));
    rig.monitor.poll_cycle().await;
    let status = rig.monitor.status();
    assert_eq!(status.cached_count, 5);
    assert!(!status.sink_healthy);

    rig.source.push_batch(batch(1000, 3));
    rig.monitor.poll_cycle().await;
    assert_eq!(rig.monitor.status().cached_count, 8);

    // Nothing reached the sink, nothing was dropped.
    assert_eq!(rig.sink.written_count(), 0);
    let cached = rig.cache.snapshot();
    assert_eq!(cached.len(), 8);
    assert_eq!(cached[0], batch(0, 5)[0]);
    assert_eq!(cached[7], batch(1000, 3)[2]);
}

/// Scenario C: with the sink reachable again, the next cycle drains all
/// ten cached measurements and clears the cache.
#[tokio::test]
async fn scenario_c_recovery_drains_cache() {
    let rig = rig(false);
    rig.cache.add(&batch(0, 10)).unwrap();

    rig.source.push_batch(batch(2000, 1));
    rig.monitor.poll_cycle().await;

    let status = rig.monitor.status();
    assert!(status.sink_healthy);
    assert_eq!(status.cached_count, 0);
    // Ten drained plus the live point.
    assert_eq!(rig.sink.written_count(), 11);

    // Drained in capture order, before the live batch.
    let written = rig.sink.written();
    assert_eq!(written[0], batch(0, 10)[0]);
    assert_eq!(written[9], batch(0, 10)[9]);
}

/// Scenario D: a drain failing at the fifth entry removes nothing from
/// the cache and leaves the sink unhealthy.
#[tokio::test]
async fn scenario_d_partial_drain_removes_nothing() {
    let rig = rig(false);
    rig.cache.add(&batch(0, 10)).unwrap();
    rig.sink.reject_after(4);

    let healthy = rig.monitor.resync().await;

    assert!(!healthy);
    let status = rig.monitor.status();
    assert!(!status.sink_healthy);
    assert_eq!(status.cached_count, 10, "prefix not removed");
    assert_eq!(rig.sink.written_count(), 4);

    // Next drain re-delivers the already-written prefix.
    rig.sink.accept_writes();
    assert!(rig.monitor.resync().await);
    assert_eq!(rig.monitor.status().cached_count, 0);
    assert_eq!(rig.sink.written_count(), 14);
}

/// Consecutive successful cycles poll contiguous half-open windows.
#[tokio::test]
async fn poll_windows_are_contiguous() {
    let rig = rig(true);

    for _ in 0..4 {
        rig.monitor.poll_cycle().await;
    }

    let windows = rig.source.fetched_windows();
    assert_eq!(windows.len(), 4);
    for pair in windows.windows(2) {
        assert_eq!(pair[1].start, pair[0].end, "no gap, no overlap");
    }
}

/// A failed fetch must not advance the window: the same span is
/// re-polled after recovery so no readings are skipped.
#[tokio::test]
async fn failed_fetch_repolls_same_window_start() {
    let rig = rig(true);

    rig.source.push_error(SourceError::Rejected("boom".into()));
    rig.monitor.poll_cycle().await;
    rig.monitor.poll_cycle().await;

    let windows = rig.source.fetched_windows();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[1].start, windows[0].start);
}

/// Measurements cached during an outage survive a process restart.
#[tokio::test]
async fn cached_measurements_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");

    {
        let cache = DurableCache::open(&cache_dir).unwrap();
        cache.add(&batch(0, 6)).unwrap();
    }

    // "Restart": a fresh cache over the same directory sees the data.
    let cache = DurableCache::open(&cache_dir).unwrap();
    assert_eq!(cache.count(), 6);
    assert_eq!(cache.snapshot()[5], batch(0, 6)[5]);
}

/// Sink loss and recovery both produce operator notifications.
#[tokio::test]
async fn sink_transitions_are_notified() {
    let rig = rig(true);

    rig.sink.reject_writes();
    rig.sink.set_healthy(false);
    rig.source.push_batch(batch(0, 2));
    rig.monitor.poll_cycle().await;

    rig.sink.accept_writes();
    rig.sink.set_healthy(true);
    rig.source.push_batch(batch(1000, 1));
    rig.monitor.poll_cycle().await;

    let sent = rig.notifier.sent();
    assert!(sent
        .iter()
        .any(|(s, t, _)| *s == Severity::Error && t == "Sink"));
    assert!(sent
        .iter()
        .any(|(s, _, b)| *s == Severity::Info && b.contains("restored")));
    assert!(sent
        .iter()
        .any(|(s, t, _)| *s == Severity::Info && t == "Cache drain"));

    // Everything arrived: 2 cached-then-drained plus 1 live.
    assert_eq!(rig.monitor.status().cached_count, 0);
    assert_eq!(rig.sink.written_count(), 3);
}
