// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded byte ring buffer holding length-prefixed records.
//!
//! Producers append whole records with [`FramedRingBuffer::put`], which never
//! blocks: if the record does not fit it is rejected and the buffer is left
//! untouched. A single consumer pulls batches with [`FramedRingBuffer::drain`],
//! optionally waiting for the first record to arrive.
//!
//! ```text
//!            read cursor                write_pos
//!                 │                         │
//!   ┌─────────────┼─────────────────────────┼──────────┐
//!   │    free     │ len│payload│len│payload │   free   │
//!   └─────────────┴─────────────────────────┴──────────┘
//!                 └──────── available ──────┘
//! ```
//!
//! The readable region is the `available` bytes ending at `write_pos`; all
//! positions wrap modulo the capacity.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::codec::{decode_length, encode_length};
use crate::errors::QueueError;

#[derive(Debug)]
struct RingState {
    storage: Box<[u8]>,
    write_pos: usize,
    available: usize,
    available_elements: usize,
    closed: bool,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn clear(&mut self) -> usize {
        let dropped = self.available_elements;
        self.write_pos = 0;
        self.available = 0;
        self.available_elements = 0;
        dropped
    }

    fn read_pos(&self) -> usize {
        let capacity = self.capacity();
        (self.write_pos + capacity - self.available) % capacity
    }

    fn append(&mut self, bytes: &[u8]) {
        let capacity = self.capacity();
        let head = bytes.len().min(capacity - self.write_pos);
        self.storage[self.write_pos..self.write_pos + head].copy_from_slice(&bytes[..head]);
        // wrap around
        self.storage[..bytes.len() - head].copy_from_slice(&bytes[head..]);
        self.write_pos = (self.write_pos + bytes.len()) % capacity;
        self.available += bytes.len();
    }

    /// Decodes the length prefix at the read cursor without consuming it.
    fn peek_length(&self) -> (usize, usize) {
        let capacity = self.capacity();
        let storage = &self.storage;
        let mut pos = self.read_pos();
        decode_length(|| {
            let byte = storage[pos];
            pos = (pos + 1) % capacity;
            byte
        })
    }

    fn take(&mut self, prefix_len: usize, length: usize) -> Vec<u8> {
        self.available -= prefix_len;

        let capacity = self.capacity();
        let start = self.read_pos();
        let mut record = Vec::with_capacity(length);
        if start + length <= capacity {
            record.extend_from_slice(&self.storage[start..start + length]);
        } else {
            record.extend_from_slice(&self.storage[start..]);
            record.extend_from_slice(&self.storage[..length - (capacity - start)]);
        }

        self.available -= length;
        self.available_elements -= 1;
        record
    }
}

/// Fixed-capacity FIFO of variable-length records.
#[derive(Debug)]
pub struct FramedRingBuffer {
    capacity: usize,
    state: Mutex<RingState>,
    changed: Condvar,
}

impl FramedRingBuffer {
    /// Creates a buffer of `capacity` bytes. Prefix bytes count against the
    /// capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be greater than 0");
        FramedRingBuffer {
            capacity,
            state: Mutex::new(RingState {
                storage: vec![0u8; capacity].into_boxed_slice(),
                write_pos: 0,
                available: 0,
                available_elements: 0,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Appends one record made of the concatenation of `segments`.
    ///
    /// # Errors
    ///
    /// - [`QueueError::CapacityExceeded`] if prefix and payload do not fit the
    ///   free space. Nothing is written in that case.
    /// - [`QueueError::Codec`] if the record is too long to be framed.
    /// - [`QueueError::Closed`] once [`close`](Self::close) was called.
    pub fn put(&self, segments: &[&[u8]]) -> Result<(), QueueError> {
        let length: usize = segments.iter().map(|segment| segment.len()).sum();
        let prefix = encode_length(length)?;
        let required = prefix.len() + length;

        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let free = self.capacity - state.available;
        if required > free {
            return Err(QueueError::CapacityExceeded { required, free });
        }

        let was_empty = state.available == 0;
        state.append(prefix.as_bytes());
        for segment in segments {
            state.append(segment);
        }
        state.available_elements += 1;

        if was_empty {
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Removes up to `max_count` records, oldest first.
    ///
    /// `max_size` caps the summed payload bytes of the batch (`None` for no
    /// cap). The cap is not applied to the first record, so an oversized
    /// record is returned on its own instead of blocking the queue.
    ///
    /// `max_wait` bounds how long to wait for a first record: `None` waits
    /// indefinitely, [`Duration::ZERO`] does not wait at all. An empty vector
    /// is returned if nothing arrived in time.
    pub fn drain(
        &self,
        max_count: usize,
        max_size: Option<usize>,
        max_wait: Option<Duration>,
    ) -> Vec<Vec<u8>> {
        let state = self.lock();
        let mut state = self.wait_for_records(state, max_wait);
        if state.available_elements == 0 {
            return Vec::new();
        }

        if state.available == self.capacity {
            // producers may be waiting for space
            self.changed.notify_all();
        }

        let max_count = max_count.max(1);
        let mut records = Vec::new();
        let mut batch_size = 0usize;
        while state.available_elements > 0 && records.len() < max_count {
            let (length, prefix_len) = state.peek_length();
            if let Some(max_size) = max_size {
                if !records.is_empty() && batch_size + length > max_size {
                    break;
                }
            }
            batch_size += length;
            records.push(state.take(prefix_len, length));
        }
        records
    }

    #[allow(clippy::expect_used)]
    fn wait_for_records<'a>(
        &self,
        guard: MutexGuard<'a, RingState>,
        max_wait: Option<Duration>,
    ) -> MutexGuard<'a, RingState> {
        match max_wait {
            Some(wait) if wait.is_zero() => guard,
            Some(wait) => {
                self.changed
                    .wait_timeout_while(guard, wait, |state| state.available_elements == 0)
                    .expect("lock poisoned")
                    .0
            }
            None => self
                .changed
                .wait_while(guard, |state| state.available_elements == 0)
                .expect("lock poisoned"),
        }
    }

    /// Logically empties and reopens the buffer. Stored bytes are not wiped.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.clear();
        state.closed = false;
    }

    /// Drops every queued record and returns how many there were. A closed
    /// buffer stays closed.
    pub fn clear(&self) -> usize {
        self.lock().clear()
    }

    /// Rejects every later [`put`](Self::put). Records already queued can
    /// still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently occupied, prefixes included.
    #[must_use]
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// Number of complete records currently queued.
    #[must_use]
    pub fn available_elements(&self) -> usize {
        self.lock().available_elements
    }

    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.available()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn used_capacity_fraction(&self) -> f64 {
        self.available() as f64 / self.capacity as f64
    }
}
