// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable fallback cache for measurements the sink could not take.
//!
//! The cache is an append-ordered in-memory list mirrored to disk as a
//! full JSON snapshot after every mutation. One snapshot file exists per
//! storage generation (`cache_YYYY-MM-DD.json`); a save within the same
//! generation replaces the file. On startup the most recently modified
//! snapshot becomes the in-memory cache, so pending measurements survive
//! a restart.
//!
//! A persistence failure is reported but never drops data: the in-memory
//! copy still holds everything, and the next successful save catches up.
//!
//! The internal mutex is a safety net for out-of-band access (status
//! queries, an administrative drain); in normal operation both the push
//! and the drain side run inside the same sequential poll cycle.

use crate::measurement::Measurement;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

const SNAPSHOT_PREFIX: &str = "cache_";
const SNAPSHOT_SUFFIX: &str = ".json";

pub struct DurableCache {
    dir: PathBuf,
    data: Mutex<Vec<Measurement>>,
}

impl DurableCache {
    /// Open a cache rooted at `dir`, creating the directory and loading
    /// the newest snapshot if one exists. A corrupt or unreadable
    /// snapshot logs a warning and starts empty rather than failing
    /// startup.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache directory {}", dir.display()))?;

        let cache = Self {
            dir,
            data: Mutex::new(Vec::new()),
        };

        match cache.load_newest_snapshot() {
            Ok(Some(count)) => {
                tracing::info!(count, dir = %cache.dir.display(), "loaded cache snapshot");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to load existing cache snapshot, starting empty");
            }
        }

        Ok(cache)
    }

    /// Append a batch and persist. The batch is kept whole: on
    /// persistence failure the entries stay in memory and the error is
    /// surfaced to the caller for alerting.
    pub fn add(&self, batch: &[Measurement]) -> Result<()> {
        let mut data = self.lock();
        data.extend_from_slice(batch);
        self.save(&data)
    }

    /// By-value snapshot of everything currently cached, in append order.
    pub fn snapshot(&self) -> Vec<Measurement> {
        self.lock().clone()
    }

    /// Number of cached measurements.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Drop the first `n` entries after a fully drained snapshot.
    /// Entries pushed after the snapshot was taken remain.
    pub fn remove_front(&self, n: usize) -> Result<()> {
        let mut data = self.lock();
        let n = n.min(data.len());
        data.drain(..n);
        self.save(&data)
    }

    /// Remove everything.
    pub fn clear(&self) -> Result<()> {
        let mut data = self.lock();
        data.clear();
        self.save(&data)
    }

    /// Delete snapshot files whose storage generation is older than
    /// `max_age`, judged by file modification time. Independent of the
    /// in-memory state: only the current generation's file is ever
    /// rewritten, older generations exist purely for retention.
    pub fn cleanup_old_snapshots(&self, max_age: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for path in self.snapshot_files()? {
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e, "failed to remove old cache snapshot");
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Current generation's snapshot path (one file per day).
    fn snapshot_path(&self) -> PathBuf {
        let day = Utc::now().format("%Y-%m-%d");
        self.dir
            .join(format!("{SNAPSHOT_PREFIX}{day}{SNAPSHOT_SUFFIX}"))
    }

    fn snapshot_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list cache directory {}", self.dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if is_snapshot_file(&path) {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn load_newest_snapshot(&self) -> Result<Option<usize>> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for path in self.snapshot_files()? {
            let modified = fs::metadata(&path)?.modified()?;
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }

        let Some((_, path)) = newest else {
            return Ok(None);
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read cache snapshot {}", path.display()))?;
        let loaded: Vec<Measurement> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse cache snapshot {}", path.display()))?;

        let count = loaded.len();
        *self.lock() = loaded;
        Ok(Some(count))
    }

    fn save(&self, data: &[Measurement]) -> Result<()> {
        let path = self.snapshot_path();
        let json = serde_json::to_string_pretty(data).context("failed to serialize cache")?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write cache snapshot {}", path.display()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Measurement>> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn is_snapshot_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(SNAPSHOT_PREFIX) && n.ends_with(SNAPSHOT_SUFFIX))
        .unwrap_or(false)
}
