// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry source abstraction.
//!
//! The orchestrator only needs one operation from the meter vendor:
//! fetch the readings inside a poll window. The production implementation
//! speaks the vendor's GraphQL API; [`MockSource`] serves tests and
//! `--mock` runs.
//!
//! Error classification matters at this boundary: the retry wrapper must
//! not burn its budget on a rejected credential, so every error carries a
//! permanent/transient verdict.

use crate::measurement::{Measurement, PollWindow};
use crate::retry::ErrorClass;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Source fetch errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Credentials rejected by the vendor. Permanent.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The vendor refused the request as malformed (4xx-class or a
    /// GraphQL validation error). Permanent.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// No metering device is registered on the account. Permanent: no
    /// amount of retrying makes a device appear.
    #[error("no metering device found for account")]
    NoDevice,

    /// Network-level failure. Transient.
    #[error("transport error: {0}")]
    Transport(String),

    /// The vendor is up but unable to serve (5xx, rate limit). Transient.
    #[error("source unavailable: status {0}")]
    Unavailable(u16),
}

impl ErrorClass for SourceError {
    fn is_permanent(&self) -> bool {
        matches!(
            self,
            SourceError::AuthRejected(_) | SourceError::Rejected(_) | SourceError::NoDevice
        )
    }
}

impl SourceError {
    fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => SourceError::AuthRejected(body),
            429 => SourceError::Unavailable(429),
            s if status.is_client_error() => SourceError::Rejected(format!("status {s}: {body}")),
            s => SourceError::Unavailable(s),
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::Transport(e.to_string())
    }
}

/// One operation: the readings captured inside `window`.
///
/// An empty window result is `Ok(vec![])`, never an error.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch(&self, window: &PollWindow) -> Result<Vec<Measurement>, SourceError>;
}

#[async_trait]
impl<T: TelemetrySource + ?Sized> TelemetrySource for std::sync::Arc<T> {
    async fn fetch(&self, window: &PollWindow) -> Result<Vec<Measurement>, SourceError> {
        (**self).fetch(window).await
    }
}

// ============================================================================
// GraphQL vendor API client
// ============================================================================

#[derive(Debug, Deserialize)]
struct GraphqlReply {
    data: Option<serde_json::Value>,
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

const TOKEN_MUTATION: &str = r#"
mutation obtainToken($apiKey: String!) {
  obtainToken(input: { apiKey: $apiKey }) {
    token
  }
}"#;

const DEVICE_QUERY: &str = r#"
query meterDevices($account: String!) {
  account(accountNumber: $account) {
    meterDevices {
      deviceId
    }
  }
}"#;

const TELEMETRY_QUERY: &str = r#"
query meterTelemetry($deviceId: String!, $start: DateTime!, $end: DateTime!) {
  meterTelemetry(deviceId: $deviceId, start: $start, end: $end, grouping: TEN_SECONDS) {
    readAt
    consumptionDelta
    demand
    costDelta
    consumption
  }
}"#;

/// Production source client for the vendor's GraphQL API.
///
/// Holds a short-lived API token obtained on first use (and re-obtained
/// after the vendor invalidates it) plus the account's device id.
pub struct GraphqlSource {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    account: String,
    token: Mutex<Option<String>>,
    device_id: Mutex<Option<String>>,
}

impl GraphqlSource {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            account: account.into(),
            token: Mutex::new(None),
            device_id: Mutex::new(None),
        }
    }

    /// Obtain a token and resolve the device id. Called once at startup
    /// (under the caller's retry policy) and again lazily if either goes
    /// missing.
    pub async fn initialize(&self) -> Result<(), SourceError> {
        self.authenticate().await?;
        self.resolve_device().await
    }

    async fn authenticate(&self) -> Result<(), SourceError> {
        let data = self
            .execute(TOKEN_MUTATION, json!({ "apiKey": self.api_key }))
            .await?;
        let token = data
            .pointer("/obtainToken/token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SourceError::AuthRejected("no token in reply".to_string()))?
            .to_string();
        *lock(&self.token) = Some(token);
        Ok(())
    }

    async fn resolve_device(&self) -> Result<(), SourceError> {
        let data = self
            .execute(DEVICE_QUERY, json!({ "account": self.account }))
            .await?;
        let device_id = data
            .pointer("/account/meterDevices/0/deviceId")
            .and_then(|v| v.as_str())
            .ok_or(SourceError::NoDevice)?
            .to_string();
        *lock(&self.device_id) = Some(device_id);
        Ok(())
    }

    async fn execute(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<serde_json::Value, SourceError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(token) = lock(&self.token).clone() {
            request = request.header("Authorization", token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::from_status(status, body));
        }

        let reply: GraphqlReply = response.json().await?;
        if let Some(errors) = reply.errors {
            let joined = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            // An expired token surfaces as a GraphQL-level auth error;
            // drop it so the next call re-authenticates.
            if joined.to_ascii_lowercase().contains("auth") {
                *lock(&self.token) = None;
                return Err(SourceError::AuthRejected(joined));
            }
            return Err(SourceError::Rejected(joined));
        }

        reply
            .data
            .ok_or_else(|| SourceError::Rejected("reply carried no data".to_string()))
    }

    fn rfc3339(t: DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[async_trait]
impl TelemetrySource for GraphqlSource {
    async fn fetch(&self, window: &PollWindow) -> Result<Vec<Measurement>, SourceError> {
        if lock(&self.token).is_none() {
            self.authenticate().await?;
        }
        if lock(&self.device_id).is_none() {
            self.resolve_device().await?;
        }
        let device_id = lock(&self.device_id).clone().ok_or(SourceError::NoDevice)?;

        let data = self
            .execute(
                TELEMETRY_QUERY,
                json!({
                    "deviceId": device_id,
                    "start": Self::rfc3339(window.start),
                    "end": Self::rfc3339(window.end),
                }),
            )
            .await?;

        let rows = data
            .pointer("/meterTelemetry")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut measurements = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(obj) = row.as_object() else { continue };
            let Some(read_at) = obj
                .get("readAt")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            else {
                // A row without a parseable timestamp cannot be written
                // anywhere; skip it rather than fail the whole window.
                tracing::debug!("skipping telemetry row with invalid readAt");
                continue;
            };

            let fields = obj
                .iter()
                .filter(|(k, _)| k.as_str() != "readAt")
                .filter_map(|(k, v)| v.as_f64().map(|f| (snake_case(k), f)));
            measurements.push(Measurement::new(read_at.with_timezone(&Utc), fields));
        }

        Ok(measurements)
    }
}

/// Vendor field names arrive camelCased; stored field names are snake_case.
fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

// ============================================================================
// Mock implementation for testing and --mock runs
// ============================================================================

/// Scripted telemetry source.
///
/// Outcomes pushed with [`push_batch`](Self::push_batch) /
/// [`push_error`](Self::push_error) are returned in order; with the
/// script exhausted, fetches return an empty batch (or synthetic data
/// when built with [`synthetic`](Self::synthetic)).
pub struct MockSource {
    script: Mutex<VecDeque<Result<Vec<Measurement>, SourceError>>>,
    windows: Mutex<Vec<PollWindow>>,
    generate: bool,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            windows: Mutex::new(Vec::new()),
            generate: false,
        }
    }

    /// A source that fabricates a plausible reading stream, for `--mock`
    /// runs without vendor credentials.
    pub fn synthetic() -> Self {
        Self {
            generate: true,
            ..Self::new()
        }
    }

    pub fn push_batch(&self, batch: Vec<Measurement>) {
        lock(&self.script).push_back(Ok(batch));
    }

    pub fn push_error(&self, err: SourceError) {
        lock(&self.script).push_back(Err(err));
    }

    /// Windows seen so far, in fetch order.
    pub fn fetched_windows(&self) -> Vec<PollWindow> {
        lock(&self.windows).clone()
    }

    fn generate_batch(window: &PollWindow) -> Vec<Measurement> {
        // One reading per 10 seconds of window, on a smooth daily curve.
        let step = chrono::Duration::seconds(10);
        let mut out = Vec::new();
        let mut t = window.start;
        while t < window.end {
            let phase = (t.timestamp() % 86_400) as f64 / 86_400.0 * std::f64::consts::TAU;
            let demand = 350.0 + 250.0 * phase.sin();
            out.push(Measurement::new(
                t,
                [
                    ("consumption_delta".to_string(), demand / 360.0),
                    ("demand".to_string(), demand),
                    ("cost_delta".to_string(), demand * 0.0007),
                    ("consumption".to_string(), 1000.0 + demand / 360.0),
                ],
            ));
            t += step;
        }
        out
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for MockSource {
    async fn fetch(&self, window: &PollWindow) -> Result<Vec<Measurement>, SourceError> {
        lock(&self.windows).push(*window);
        if let Some(outcome) = lock(&self.script).pop_front() {
            return outcome;
        }
        if self.generate {
            return Ok(Self::generate_batch(window));
        }
        Ok(Vec::new())
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
    use chrono::TimeZone;

    fn window(start: i64, end: i64) -> PollWindow {
        PollWindow::new(
            Utc.timestamp_opt(start, 0).unwrap(),
            Utc.timestamp_opt(end, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_error_classification() {
        assert!(SourceError::AuthRejected("bad key".into()).is_permanent());
        assert!(SourceError::Rejected("bad query".into()).is_permanent());
        assert!(SourceError::NoDevice.is_permanent());
        assert!(!SourceError::Transport("reset".into()).is_permanent());
        assert!(!SourceError::Unavailable(503).is_permanent());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            SourceError::from_status(reqwest::StatusCode::UNAUTHORIZED, String::new()),
            SourceError::AuthRejected(_)
        ));
        assert!(matches!(
            SourceError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new()),
            SourceError::Unavailable(429)
        ));
        assert!(matches!(
            SourceError::from_status(reqwest::StatusCode::BAD_REQUEST, String::new()),
            SourceError::Rejected(_)
        ));
        assert!(matches!(
            SourceError::from_status(reqwest::StatusCode::BAD_GATEWAY, String::new()),
            SourceError::Unavailable(502)
        ));
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("consumptionDelta"), "consumption_delta");
        assert_eq!(snake_case("demand"), "demand");
        assert_eq!(snake_case("costDelta"), "cost_delta");
    }

    #[tokio::test]
    async fn test_mock_source_scripted_order() {
        let source = MockSource::new();
        source.push_error(SourceError::Transport("down".into()));
        source.push_batch(vec![Measurement::new(
            Utc.timestamp_opt(5, 0).unwrap(),
            [("demand", 1.0)],
        )]);

        assert!(source.fetch(&window(0, 10)).await.is_err());
        let batch = source.fetch(&window(10, 20)).await.unwrap();
        assert_eq!(batch.len(), 1);
        // Exhausted script yields empty batches, not errors.
        assert!(source.fetch(&window(20, 30)).await.unwrap().is_empty());

        let windows = source.fetched_windows();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[1].start, windows[0].end);
    }

    #[tokio::test]
    async fn test_synthetic_source_fills_window() {
        let source = MockSource::synthetic();
        let batch = source.fetch(&window(0, 60)).await.unwrap();
        assert_eq!(batch.len(), 6);
        assert!(batch[0].fields.contains_key("demand"));
        assert!(batch[0].fields.contains_key("consumption_delta"));
    }
}
