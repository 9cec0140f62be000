// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry data model.
//!
//! A [`Measurement`] is one reading from the meter: a timestamp plus an
//! ordered set of named numeric fields. The field set is fixed per
//! deployment but not assumed here; negative values are valid (energy
//! exported rather than consumed).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One telemetry reading. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// When the meter produced the reading.
    #[serde(rename = "timestamp")]
    pub read_at: DateTime<Utc>,

    /// Named numeric fields, in stable (sorted) order.
    #[serde(flatten)]
    pub fields: BTreeMap<String, f64>,
}

impl Measurement {
    /// Build a measurement from a timestamp and field pairs.
    pub fn new<I, K>(read_at: DateTime<Utc>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            read_at,
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Timestamp in nanoseconds since the Unix epoch.
    ///
    /// Saturates at the representable range rather than wrapping; readings
    /// outside 1677..2262 do not occur on real meters.
    pub fn timestamp_ns(&self) -> i64 {
        self.read_at.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

/// Half-open poll window `[start, end)`.
///
/// Consecutive windows are contiguous: each window starts exactly where the
/// previous one ended, so no reading is fetched twice or skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PollWindow {
    /// Create a window, rejecting `end < start`.
    ///
    /// A negative window is a programming error in the caller, never a
    /// runtime condition, so it fails loud instead of clamping.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<Self> {
        debug_assert!(end >= start, "negative poll window: {} > {}", start, end);
        if end < start {
            anyhow::bail!("negative poll window: start {} is after end {}", start, end);
        }
        Ok(Self { start, end })
    }

    /// The next contiguous window, ending at `now`.
    pub fn advance(&self, now: DateTime<Utc>) -> anyhow::Result<Self> {
        Self::new(self.end, now)
    }

    /// Window length.
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}
