// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-series sink abstraction.
//!
//! Three operations: a single-point synchronous write (used for both
//! live traffic and cache drains), a reachability check, and a flush for
//! clients that buffer. The production implementation writes InfluxDB v2
//! Line Protocol over HTTP; [`MockSink`] serves tests and `--mock` runs.
//!
//! Writes are naturally idempotent at the sink: a point is keyed by
//! measurement, tag set, and timestamp, so re-delivering a prefix after
//! an aborted drain overwrites identical values instead of duplicating.

use crate::line_protocol::encode_point;
use crate::measurement::Measurement;
use crate::retry::ErrorClass;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// Sink errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Token rejected. Permanent.
    #[error("sink authentication rejected: {0}")]
    AuthRejected(String),

    /// The sink refused the payload (4xx-class). Permanent.
    #[error("sink rejected write: status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The sink is up but unable to serve (5xx, rate limit). Transient.
    #[error("sink unavailable: status {0}")]
    Unavailable(u16),

    /// Network-level failure. Transient.
    #[error("sink transport error: {0}")]
    Transport(String),

    /// Health endpoint reachable but reporting failure. Transient.
    #[error("sink unhealthy: {0}")]
    Unhealthy(String),
}

impl ErrorClass for SinkError {
    fn is_permanent(&self) -> bool {
        matches!(self, SinkError::AuthRejected(_) | SinkError::Rejected { .. })
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        SinkError::Transport(e.to_string())
    }
}

/// Sink operations the orchestrator depends on.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    /// Write one point, durably from the caller's perspective once `Ok`.
    async fn write_point(&self, point: &Measurement) -> Result<(), SinkError>;

    /// Out-of-band reachability check, distinct from the write path.
    async fn health_check(&self) -> Result<(), SinkError>;

    /// Make any buffered writes durable before the cycle completes.
    async fn flush(&self) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: TimeSeriesSink + ?Sized> TimeSeriesSink for std::sync::Arc<T> {
    async fn write_point(&self, point: &Measurement) -> Result<(), SinkError> {
        (**self).write_point(point).await
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        (**self).health_check().await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        (**self).flush().await
    }
}

// ============================================================================
// InfluxDB v2 client
// ============================================================================

/// InfluxDB v2 HTTP sink.
///
/// Points are written one per request through the `/api/v2/write`
/// endpoint with nanosecond precision; `flush` is a no-op because nothing
/// is buffered client-side.
pub struct InfluxSink {
    http: reqwest::Client,
    write_url: String,
    health_url: String,
    token: String,
    measurement: String,
    tags: Vec<(String, String)>,
}

impl InfluxSink {
    pub fn new(url: &str, token: &str, org: &str, bucket: &str, measurement: &str) -> Self {
        let base = url.trim_end_matches('/');
        Self {
            http: reqwest::Client::new(),
            write_url: format!("{base}/api/v2/write?org={org}&bucket={bucket}&precision=ns"),
            health_url: format!("{base}/health"),
            token: token.to_string(),
            measurement: measurement.to_string(),
            tags: vec![("source".to_string(), "fluxmon".to_string())],
        }
    }

    fn classify(status: reqwest::StatusCode, body: String) -> SinkError {
        match status.as_u16() {
            401 | 403 => SinkError::AuthRejected(body),
            429 => SinkError::Unavailable(429),
            s if status.is_client_error() => SinkError::Rejected { status: s, body },
            s => SinkError::Unavailable(s),
        }
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxSink {
    async fn write_point(&self, point: &Measurement) -> Result<(), SinkError> {
        let tags: Vec<(&str, &str)> = self
            .tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let line = encode_point(&self.measurement, &tags, point);

        let response = self
            .http
            .post(&self.write_url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status, body))
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        let response = self.http.get(&self.health_url).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(SinkError::Unhealthy(format!("health endpoint returned {status}")))
    }

    async fn flush(&self) -> Result<(), SinkError> {
        // Every write is already a completed HTTP request.
        Ok(())
    }
}

// ============================================================================
// Mock implementation for testing and --mock runs
// ============================================================================

enum WriteMode {
    Accept,
    RejectAll,
    /// Accept this many more writes, then reject.
    AcceptThenReject(usize),
}

/// Recording sink with scriptable failures.
pub struct MockSink {
    written: Mutex<Vec<Measurement>>,
    mode: Mutex<WriteMode>,
    healthy: AtomicBool,
    flushes: AtomicU32,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            written: Mutex::new(Vec::new()),
            mode: Mutex::new(WriteMode::Accept),
            healthy: AtomicBool::new(true),
            flushes: AtomicU32::new(0),
        }
    }

    /// Every point written so far, in write order (re-deliveries
    /// included).
    pub fn written(&self) -> Vec<Measurement> {
        lock(&self.written).clone()
    }

    pub fn written_count(&self) -> usize {
        lock(&self.written).len()
    }

    pub fn flush_count(&self) -> u32 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Control the health probe result.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// All subsequent writes fail.
    pub fn reject_writes(&self) {
        *lock(&self.mode) = WriteMode::RejectAll;
    }

    /// Accept `n` writes, fail from the `n+1`-th on. Drives the
    /// mid-drain failure scenarios.
    pub fn reject_after(&self, n: usize) {
        *lock(&self.mode) = WriteMode::AcceptThenReject(n);
    }

    /// Back to accepting everything.
    pub fn accept_writes(&self) {
        *lock(&self.mode) = WriteMode::Accept;
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSeriesSink for MockSink {
    async fn write_point(&self, point: &Measurement) -> Result<(), SinkError> {
        let mut mode = lock(&self.mode);
        match &mut *mode {
            WriteMode::Accept => {}
            WriteMode::RejectAll => return Err(SinkError::Unavailable(503)),
            WriteMode::AcceptThenReject(0) => return Err(SinkError::Unavailable(503)),
            WriteMode::AcceptThenReject(n) => *n -= 1,
        }
        drop(mode);
        lock(&self.written).push(point.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SinkError::Unhealthy("mock sink marked down".to_string()))
        }
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn point(secs: i64) -> Measurement {
        Measurement::new(Utc.timestamp_opt(secs, 0).unwrap(), [("demand", 1.0)])
    }

    #[test]
    fn test_error_classification() {
        assert!(SinkError::AuthRejected("bad token".into()).is_permanent());
        assert!(SinkError::Rejected { status: 400, body: String::new() }.is_permanent());
        assert!(!SinkError::Unavailable(503).is_permanent());
        assert!(!SinkError::Transport("reset".into()).is_permanent());
        assert!(!SinkError::Unhealthy("down".into()).is_permanent());
    }

    #[test]
    fn test_influx_urls() {
        let sink = InfluxSink::new("http://influx.local:8086/", "tok", "home", "energy", "m");
        assert_eq!(
            sink.write_url,
            "http://influx.local:8086/api/v2/write?org=home&bucket=energy&precision=ns"
        );
        assert_eq!(sink.health_url, "http://influx.local:8086/health");
    }

    #[tokio::test]
    async fn test_mock_sink_records_in_order() {
        let sink = MockSink::new();
        sink.write_point(&point(1)).await.unwrap();
        sink.write_point(&point(2)).await.unwrap();
        let written = sink.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], point(1));
    }

    #[tokio::test]
    async fn test_mock_sink_reject_after() {
        let sink = MockSink::new();
        sink.reject_after(2);
        assert!(sink.write_point(&point(1)).await.is_ok());
        assert!(sink.write_point(&point(2)).await.is_ok());
        assert!(sink.write_point(&point(3)).await.is_err());
        assert_eq!(sink.written_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_sink_health_toggle() {
        let sink = MockSink::new();
        assert!(sink.health_check().await.is_ok());
        sink.set_healthy(false);
        assert!(sink.health_check().await.is_err());
    }
}
