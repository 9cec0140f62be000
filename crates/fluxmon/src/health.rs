// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP health and status endpoints.
//!
//! - `GET /health` - liveness: answers 200 whenever the process runs
//! - `GET /ready` - readiness: 200 only while source and sink are usable
//! - `GET /status` - the monitor's status snapshot as JSON
//!
//! Handlers only take state snapshots; they never block on the poll loop.

use crate::cache::DurableCache;
use crate::state::{MonitorState, StatusSnapshot};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Read-only view over the monitor for status endpoints.
#[derive(Clone)]
pub struct StatusHandle {
    state: Arc<MonitorState>,
    cache: Arc<DurableCache>,
}

impl StatusHandle {
    pub fn new(state: Arc<MonitorState>, cache: Arc<DurableCache>) -> Self {
        Self { state, cache }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.snapshot(self.cache.count())
    }
}

#[derive(Debug, Serialize)]
struct LivenessReply {
    status: &'static str,
    timestamp: String,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ComponentHealth {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReadinessReply {
    ready: bool,
    timestamp: String,
    components: BTreeMap<&'static str, ComponentHealth>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

async fn liveness() -> Json<LivenessReply> {
    Json(LivenessReply {
        status: "healthy",
        timestamp: now_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn readiness(State(handle): State<StatusHandle>) -> impl IntoResponse {
    let snapshot = handle.snapshot();

    let mut components = BTreeMap::new();
    components.insert(
        "source",
        if snapshot.degraded {
            ComponentHealth {
                status: "degraded",
                message: Some(format!(
                    "{} consecutive fetch errors, backoff factor {}",
                    snapshot.consecutive_source_errors, snapshot.backoff_factor
                )),
            }
        } else {
            ComponentHealth {
                status: "healthy",
                message: None,
            }
        },
    );
    components.insert(
        "sink",
        if snapshot.sink_healthy {
            ComponentHealth {
                status: "healthy",
                message: None,
            }
        } else {
            ComponentHealth {
                status: "unhealthy",
                message: Some(format!(
                    "writes diverted to cache ({} pending)",
                    snapshot.cached_count
                )),
            }
        },
    );

    // Degraded polling still serves stale-but-real data; only a lost
    // sink makes the service not ready.
    let ready = snapshot.sink_healthy;
    let reply = ReadinessReply {
        ready,
        timestamp: now_rfc3339(),
        components,
    };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(reply))
}

async fn status(State(handle): State<StatusHandle>) -> Json<StatusSnapshot> {
    Json(handle.snapshot())
}

pub fn router(handle: StatusHandle) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .route("/status", get(status))
        .with_state(handle)
}

/// Serve the health endpoints until the shutdown signal flips.
pub async fn serve(
    addr: &str,
    handle: StatusHandle,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "health server listening");

    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    tracing::info!("health server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MonitorState;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn handle(sink_healthy: bool) -> StatusHandle {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DurableCache::open(dir.path()).unwrap());
        // The tempdir guard drops here; the cache only touches disk on
        // mutation, which these tests never do.
        let state = Arc::new(MonitorState::new(3, 4, sink_healthy, Utc::now()));
        StatusHandle::new(state, cache)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_liveness_always_ok() {
        let app = router(handle(false));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_readiness_healthy() {
        let app = router(handle(true));
        let response = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["ready"], true);
        assert_eq!(json["components"]["sink"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_readiness_unhealthy_sink_is_503() {
        let app = router(handle(false));
        let response = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(response).await;
        assert_eq!(json["ready"], false);
        assert_eq!(json["components"]["sink"]["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_status_snapshot_fields() {
        let app = router(handle(true));
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["sink_healthy"], true);
        assert_eq!(json["degraded"], false);
        assert_eq!(json["backoff_factor"], 1);
        assert_eq!(json["cached_count"], 0);
    }
}
