// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fluxmon - resilient smart-meter telemetry collection.
//!
//! Polls a meter vendor's API for readings and writes them to an
//! InfluxDB v2 sink, surviving outages on either side:
//!
//! - **Adaptive polling** -- sustained fetch failures enter a degraded
//!   mode that stretches the poll interval instead of hammering a
//!   failing source
//! - **Durable cache fallback** -- batches the sink cannot take are
//!   parked in a disk-backed cache and drained automatically once the
//!   sink recovers, with no loss and no operator intervention
//! - **Retry + circuit breaking** -- every external call runs under an
//!   exponential-backoff retry and a per-downstream circuit breaker
//!
//! # Architecture
//!
//! ```text
//! Monitor (poll loop)
//! +-- TelemetrySource   (vendor GraphQL API, or mock)
//! +-- TimeSeriesSink    (InfluxDB v2 Line Protocol, or mock)
//! +-- DurableCache      (JSON snapshot per generation)
//! +-- Notifier          (best-effort webhook alerts)
//! +-- MonitorState      (shared status, RwLock + snapshots)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fluxmon::{Config, DurableCache, GraphqlSource, InfluxSink, Monitor, NoopNotifier};
//!
//! let config = Config::load(Some(Path::new("config.yaml")))?;
//! let cache = Arc::new(DurableCache::open(&config.cache.dir)?);
//! let source = GraphqlSource::new(&config.source.endpoint, &config.source.api_key, &config.source.account);
//! let sink = InfluxSink::new(&config.influxdb.url, &config.influxdb.token,
//!     &config.influxdb.org, &config.influxdb.bucket, &config.influxdb.measurement);
//!
//! let monitor = Monitor::new(config, source, sink, NoopNotifier, cache, true);
//! monitor.run(shutdown_rx).await;
//! ```

pub mod breaker;
pub mod cache;
pub mod config;
pub mod health;
pub mod line_protocol;
pub mod measurement;
pub mod monitor;
pub mod notify;
pub mod redact;
pub mod resilience;
pub mod retry;
pub mod sink;
pub mod source;
pub mod state;
pub mod supervisor;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use cache::DurableCache;
pub use config::Config;
pub use health::StatusHandle;
pub use measurement::{Measurement, PollWindow};
pub use monitor::Monitor;
pub use notify::{NoopNotifier, Notifier, NotifyError, RecordingNotifier, Severity, WebhookNotifier};
pub use resilience::{CallError, Guard};
pub use retry::{ErrorClass, RetryPolicy};
pub use sink::{InfluxSink, MockSink, SinkError, TimeSeriesSink};
pub use source::{GraphqlSource, MockSource, SourceError, TelemetrySource};
pub use state::{MonitorState, StatusSnapshot};
pub use supervisor::TaskSupervisor;
