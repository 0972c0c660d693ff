// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery statistics: lifetime totals plus rolling-window counts for
//! indexed, discarded and failed records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::rolling_counter::RollingEventCounter;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

#[derive(Debug)]
struct EventCounter {
    total: AtomicU64,
    window: Mutex<RollingEventCounter>,
}

impl EventCounter {
    fn new(slot_size: Duration, slot_count: usize) -> Self {
        EventCounter {
            total: AtomicU64::new(0),
            window: Mutex::new(RollingEventCounter::new(slot_size, slot_count)),
        }
    }

    #[allow(clippy::expect_used)]
    fn window(&self) -> MutexGuard<'_, RollingEventCounter> {
        self.window.lock().expect("lock poisoned")
    }

    fn record(&self, timestamp_ms: u64, count: u64) {
        self.total.fetch_add(count, Ordering::Relaxed);
        self.window().add_events(timestamp_ms, count);
    }

    fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn windowed(&self, timestamp_ms: u64) -> u64 {
        self.window().event_count(timestamp_ms)
    }

    fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.window().reset();
    }
}

#[derive(Debug)]
pub(crate) struct Statistics {
    indexed: EventCounter,
    discarded: EventCounter,
    failed: EventCounter,
}

impl Statistics {
    pub(crate) fn new(slot_size: Duration, slot_count: usize) -> Self {
        Statistics {
            indexed: EventCounter::new(slot_size, slot_count),
            discarded: EventCounter::new(slot_size, slot_count),
            failed: EventCounter::new(slot_size, slot_count),
        }
    }

    pub(crate) fn record_indexed(&self, timestamp_ms: u64, count: u64) {
        self.indexed.record(timestamp_ms, count);
    }

    pub(crate) fn record_discarded(&self, timestamp_ms: u64, count: u64) {
        self.discarded.record(timestamp_ms, count);
    }

    pub(crate) fn record_failed(&self, timestamp_ms: u64, count: u64) {
        self.failed.record(timestamp_ms, count);
    }

    pub(crate) fn total_indexed(&self) -> u64 {
        self.indexed.total()
    }

    pub(crate) fn total_discarded(&self) -> u64 {
        self.discarded.total()
    }

    pub(crate) fn total_failed(&self) -> u64 {
        self.failed.total()
    }

    pub(crate) fn indexed_in_window(&self, timestamp_ms: u64) -> u64 {
        self.indexed.windowed(timestamp_ms)
    }

    pub(crate) fn discarded_in_window(&self, timestamp_ms: u64) -> u64 {
        self.discarded.windowed(timestamp_ms)
    }

    pub(crate) fn failed_in_window(&self, timestamp_ms: u64) -> u64 {
        self.failed.windowed(timestamp_ms)
    }

    /// Length of the rolling windows.
    pub(crate) fn window(&self) -> Duration {
        self.indexed.window().window()
    }

    pub(crate) fn reset(&self) {
        self.indexed.reset();
        self.discarded.reset();
        self.failed.reset();
    }
}

/// Point-in-time view of a shipper's counters.
///
/// The `*_in_window` fields cover the trailing `window_ms` milliseconds; the
/// `total_*` fields count since start or the last statistics reset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_indexed: u64,
    pub total_discarded: u64,
    pub total_failed: u64,
    pub total_lost: u64,
    pub indexed_in_window: u64,
    pub discarded_in_window: u64,
    pub failed_in_window: u64,
    pub lost_in_window: u64,
    pub window_ms: u64,
    pub queue_length: usize,
    pub queue_fill_fraction: f64,
}
