// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Approximate event rate over a trailing time window.
//!
//! Time is cut into slots of `slot_size`; the counter retains the tallies of
//! the last `slot_count` completed slots plus a running tally for the slot in
//! progress. The reported count is the sum of the retained completed slots,
//! kept up to date incrementally as slots rotate.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RollingEventCounter {
    slot_size_ms: u64,
    slots: Box<[u64]>,
    head: usize,
    slot_sum: u64,
    current_count: u64,
    current_slot: u64,
}

impl RollingEventCounter {
    /// # Panics
    ///
    /// Panics if `slot_count` is zero or `slot_size` is shorter than a
    /// millisecond.
    #[must_use]
    pub fn new(slot_size: Duration, slot_count: usize) -> Self {
        let slot_size_ms = u64::try_from(slot_size.as_millis()).unwrap_or(u64::MAX);
        assert!(slot_size_ms > 0, "slot size must be at least 1ms");
        assert!(slot_count > 0, "slot count must be greater than 0");
        RollingEventCounter {
            slot_size_ms,
            slots: vec![0; slot_count].into_boxed_slice(),
            head: 0,
            slot_sum: 0,
            current_count: 0,
            current_slot: 0,
        }
    }

    /// Length of the trailing window.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.slot_size_ms.saturating_mul(self.slots.len() as u64))
    }

    /// Records `count` events at `timestamp_ms` (milliseconds since the epoch).
    pub fn add_events(&mut self, timestamp_ms: u64, count: u64) {
        self.advance(timestamp_ms);
        self.current_count += count;
    }

    /// Number of events seen in the retained slots as of `timestamp_ms`.
    pub fn event_count(&mut self, timestamp_ms: u64) -> u64 {
        self.advance(timestamp_ms);
        self.slot_sum
    }

    pub fn reset(&mut self) {
        self.slots.fill(0);
        self.head = 0;
        self.slot_sum = 0;
        self.current_count = 0;
    }

    fn advance(&mut self, timestamp_ms: u64) {
        let slot = timestamp_ms / self.slot_size_ms;
        // timestamps from the past are accounted to the current slot
        if slot <= self.current_slot {
            return;
        }

        let slot_count = self.slots.len();
        let gap = slot - self.current_slot;
        if gap > slot_count as u64 {
            self.reset();
            self.current_slot = slot;
            return;
        }

        // the finished slot replaces the oldest retained one
        self.slot_sum = self.slot_sum + self.current_count - self.slots[self.head];
        self.slots[self.head] = self.current_count;
        self.head = (self.head + 1) % slot_count;

        // slots skipped without events
        for _ in 1..gap {
            self.slot_sum -= self.slots[self.head];
            self.slots[self.head] = 0;
            self.head = (self.head + 1) % slot_count;
        }

        self.current_slot = slot;
        self.current_count = 0;
    }
}
