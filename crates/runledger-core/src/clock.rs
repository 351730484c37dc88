// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Injected time source.
//!
//! Every timestamp the core writes (event `emittedAt`, run `createdAt`) comes
//! from a [`Clock`]. Production uses [`SystemClock`], which never hands out the
//! same millisecond twice; tests use [`ManualClock`] for byte-stable output.

use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

/// Format a timestamp the way every persisted field is written:
/// RFC 3339, millisecond precision, `Z` suffix.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp written by [`format_timestamp`] (or any RFC 3339 string).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Source of UTC time.
pub trait Clock: Send + Sync {
    /// Current instant. Successive calls never go backwards.
    fn now(&self) -> DateTime<Utc>;

    /// Current instant as an ISO-8601 string.
    fn now_iso(&self) -> String {
        format_timestamp(self.now())
    }
}

/// Wall clock, truncated to milliseconds and forced strictly increasing.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now();
        let wall = DateTime::from_timestamp_millis(wall.timestamp_millis()).unwrap_or(wall);

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let next = match *last {
            Some(prev) if wall <= prev => prev + TimeDelta::milliseconds(1),
            _ => wall,
        };
        *last = Some(next);
        next
    }
}

/// Deterministic clock for tests: starts at a fixed instant and advances by a
/// fixed step on every read.
///
/// With a zero step the clock only moves through [`ManualClock::advance`],
/// which is what token-bucket tests want.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
    step: TimeDelta,
}

impl ManualClock {
    /// Clock starting at `start`, ticking 1ms per read.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_step(start, TimeDelta::milliseconds(1))
    }

    /// Clock starting at `start`, ticking `step` per read.
    pub fn with_step(start: DateTime<Utc>, step: TimeDelta) -> Self {
        Self {
            current: Mutex::new(start),
            step,
        }
    }

    /// Clock starting at 2025-01-01T00:00:00Z.
    pub fn epoch() -> Self {
        Self::new(DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }

    /// Move the clock forward without reading it.
    pub fn advance(&self, by: std::time::Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += delta;
    }

    /// Current value without ticking.
    pub fn peek(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let value = *current;
        *current = value + self.step;
        value
    }
}
