// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fluxmon service binary.
//!
//! Wires the telemetry source, sink, cache, and notifier into the
//! monitor, supervises the background tasks, and handles graceful
//! shutdown.
//!
//! # Usage
//!
//! ```bash
//! # Run against the real vendor API and InfluxDB
//! fluxmon --config config.yaml
//!
//! # Run with synthetic data and a recording sink (no credentials)
//! fluxmon --mock
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use fluxmon::health::StatusHandle;
use fluxmon::notify::{NoopNotifier, Notifier, Severity, WebhookNotifier};
use fluxmon::retry::RetryPolicy;
use fluxmon::sink::{InfluxSink, MockSink, TimeSeriesSink};
use fluxmon::source::{GraphqlSource, MockSource, TelemetrySource};
use fluxmon::{Config, DurableCache, Monitor, TaskSupervisor};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "fluxmon")]
#[command(about = "Resilient smart-meter telemetry collector", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run with a synthetic source and recording sink (for testing
    /// without credentials)
    #[arg(long)]
    mock: bool,

    /// Override the configured log filter
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.mock {
        mock_config()
    } else {
        Config::load(Some(&args.config))?
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fluxmon starting");
    tracing::info!(
        poll_interval_secs = config.poll_interval_secs,
        cache_dir = %config.cache.dir,
        sink = %config.influxdb.url,
        "configuration loaded"
    );

    let cache = Arc::new(DurableCache::open(&config.cache.dir)?);

    let notifier: Arc<dyn Notifier> = if config.notify.enabled {
        tracing::info!("webhook notifications enabled");
        Arc::new(WebhookNotifier::new(config.notify.webhook_url.clone()))
    } else {
        tracing::info!("notifications disabled");
        Arc::new(NoopNotifier)
    };

    if args.mock {
        tracing::info!("running with synthetic source and recording sink");
        let source = MockSource::synthetic();
        let sink = MockSink::new();
        run_service(config, source, sink, notifier, cache, true).await
    } else {
        let source = GraphqlSource::new(
            &config.source.endpoint,
            &config.source.api_key,
            &config.source.account,
        );
        // Authentication failure here is permanent and fatal; the retry
        // only rides out a flaky network at boot.
        RetryPolicy::with_max_elapsed(config.connect_timeout())
            .run(|| source.initialize())
            .await
            .context("failed to initialize telemetry source")?;
        tracing::info!("telemetry source initialized");

        let sink = InfluxSink::new(
            &config.influxdb.url,
            &config.influxdb.token,
            &config.influxdb.org,
            &config.influxdb.bucket,
            &config.influxdb.measurement,
        );
        let sink_healthy = match RetryPolicy::with_max_elapsed(config.connect_timeout())
            .run(|| sink.health_check())
            .await
        {
            Ok(()) => {
                tracing::info!("sink reachable");
                true
            }
            Err(e) => {
                tracing::warn!(error = %fluxmon::redact::redact(&e.to_string()),
                    "sink unreachable at startup, measurements will be cached locally");
                false
            }
        };

        run_service(config, source, sink, notifier, cache, sink_healthy).await
    }
}

fn mock_config() -> Config {
    let mut cfg = Config::default();
    cfg.source.api_key = "mock-key-0000000000000000000000000000".to_string();
    cfg.source.account = "MOCK-0001".to_string();
    cfg.influxdb.token = "mock-token".to_string();
    cfg.influxdb.org = "mock".to_string();
    cfg.notify.enabled = false;
    cfg
}

async fn run_service<S, K>(
    config: Config,
    source: S,
    sink: K,
    notifier: Arc<dyn Notifier>,
    cache: Arc<DurableCache>,
    sink_healthy: bool,
) -> Result<()>
where
    S: TelemetrySource + 'static,
    K: TimeSeriesSink + 'static,
{
    let shutdown_timeout = config.shutdown_timeout();
    let cleanup_enabled = config.cache.cleanup_enabled;
    let health_addr = config.health_addr.clone();

    let monitor = Arc::new(Monitor::new(
        config,
        source,
        sink,
        notifier,
        Arc::clone(&cache),
        sink_healthy,
    ));

    let mut supervisor = TaskSupervisor::new();

    {
        let monitor = Arc::clone(&monitor);
        let shutdown = supervisor.subscribe();
        supervisor.spawn("poll-loop", async move {
            monitor.run(shutdown).await;
        });
    }

    if cleanup_enabled {
        let monitor = Arc::clone(&monitor);
        let shutdown = supervisor.subscribe();
        supervisor.spawn("cache-cleanup", async move {
            monitor.run_cache_cleanup(shutdown).await;
        });
    }

    {
        let handle = StatusHandle::new(monitor.state(), Arc::clone(&cache));
        let shutdown = supervisor.subscribe();
        supervisor.spawn("health-server", async move {
            if let Err(e) = fluxmon::health::serve(&health_addr, handle, shutdown).await {
                tracing::error!(error = %e, "health server failed");
            }
        });
    }

    monitor
        .alert(
            Severity::Info,
            "Monitor started",
            "Telemetry monitor started successfully".to_string(),
        )
        .await;

    wait_for_shutdown_signal().await?;
    tracing::info!("shutdown signal received, stopping");

    let clean = supervisor.shutdown(shutdown_timeout).await;
    if !clean {
        tracing::warn!("not all tasks stopped within the shutdown timeout");
    }

    let remaining = cache.count();
    if remaining > 0 {
        tracing::warn!(remaining, "stopping with measurements still cached");
        monitor
            .alert(
                Severity::Warning,
                "Monitor stopped",
                format!("Monitor stopped with {remaining} measurements in cache"),
            )
            .await;
    } else {
        monitor
            .alert(
                Severity::Info,
                "Monitor stopped",
                "Monitor stopped gracefully".to_string(),
            )
            .await;
    }

    tracing::info!("fluxmon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to register SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
    }
    Ok(())
}
