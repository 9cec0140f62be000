// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Best-effort operator notifications.
//!
//! State changes worth a human's attention (degraded mode, sink lost or
//! restored, cache drained) go through a webhook. Delivery is strictly
//! fire-and-forget from the orchestrator's perspective: a failed send is
//! logged and never influences polling, caching, or health state.

use crate::retry::ErrorClass;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Mutex;

/// Notification severity, mapped to the webhook's attachment color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    fn color(self) -> &'static str {
        match self {
            Severity::Info => "good",
            Severity::Warning => "warning",
            Severity::Error => "danger",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Network-level failure. Transient.
    #[error("notification transport error: {0}")]
    Transport(String),

    /// The webhook endpoint refused the payload. Permanent (a malformed
    /// payload or revoked webhook does not fix itself).
    #[error("webhook rejected notification: status {0}")]
    Rejected(u16),

    /// The webhook endpoint is temporarily unable to accept. Transient.
    #[error("webhook unavailable: status {0}")]
    Unavailable(u16),
}

impl ErrorClass for NotifyError {
    fn is_permanent(&self) -> bool {
        matches!(self, NotifyError::Rejected(_))
    }
}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        NotifyError::Transport(e.to_string())
    }
}

/// Fire-and-forget notification delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, title: &str, body: &str)
        -> Result<(), NotifyError>;
}

#[async_trait]
impl<T: Notifier + ?Sized> Notifier for std::sync::Arc<T> {
    async fn notify(
        &self,
        severity: Severity,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        (**self).notify(severity, title, body).await
    }
}

// ============================================================================
// Webhook implementation (Slack-compatible payload)
// ============================================================================

#[derive(Debug, Serialize)]
struct WebhookMessage {
    attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
struct Attachment {
    color: &'static str,
    title: String,
    text: String,
    footer: &'static str,
    ts: i64,
}

pub struct WebhookNotifier {
    http: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        severity: Severity,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let message = WebhookMessage {
            attachments: vec![Attachment {
                color: severity.color(),
                title: title.to_string(),
                text: body.to_string(),
                footer: "fluxmon",
                ts: Utc::now().timestamp(),
            }],
        };

        let response = self.http.post(&self.webhook_url).json(&message).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(NotifyError::Rejected(status.as_u16()))
        } else {
            Err(NotifyError::Unavailable(status.as_u16()))
        }
    }
}

// ============================================================================
// Null and recording implementations
// ============================================================================

/// Notifier used when notifications are disabled.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _: Severity, _: &str, _: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Records every notification; for assertions in tests.
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Severity, String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(Severity, String, String)> {
        match self.sent.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Titles only, for compact assertions.
    pub fn titles(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, t, _)| t).collect()
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        severity: Severity,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let mut sent = match self.sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sent.push((severity, title.to_string(), body.to_string()));
        Ok(())
    }
}
