// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background task supervision.
//!
//! Owns the shared shutdown signal and every long-lived task the service
//! spawns. Shutdown flips the signal once, then waits for all tasks with
//! a bounded timeout; stragglers are logged, not crashed on, so teardown
//! is deterministic in tests and clean in production.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct TaskSupervisor {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// A receiver for the shared shutdown signal. Tasks must observe it
    /// within one tick of their own timers.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn and track a named task.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(task = %name, "spawning supervised task");
        self.tasks.push((name, tokio::spawn(future)));
    }

    /// Number of tasks still tracked.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Flip the shutdown signal and wait up to `timeout` for all tasks.
    /// Returns false if any task outlived the timeout (it is left
    /// detached and logged).
    pub async fn shutdown(mut self, timeout: Duration) -> bool {
        tracing::info!(tasks = self.tasks.len(), "shutting down supervised tasks");
        // Receivers observe the flip; send only errs with zero receivers.
        let _ = self.shutdown_tx.send(true);

        let mut clean = true;
        let deadline = tokio::time::Instant::now() + timeout;
        for (name, handle) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {
                    tracing::debug!(task = %name, "task finished");
                }
                Ok(Err(join_err)) => {
                    tracing::error!(task = %name, error = %join_err, "task panicked before shutdown");
                    clean = false;
                }
                Err(_) => {
                    tracing::warn!(task = %name, "task did not stop within shutdown timeout");
                    clean = false;
                }
            }
        }
        clean
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
