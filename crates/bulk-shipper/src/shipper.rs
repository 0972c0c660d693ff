// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background shipping of queued records.
//!
//! Producers call [`Shipper::queue`], which frames the record into the ring
//! buffer and returns immediately. A dedicated thread drains batches and
//! hands them to the [`Sink`]:
//!
//! ```text
//!   producers ──queue()──> FramedRingBuffer ──drain()──> shipping thread ──> Sink
//!                 │ full / stopped                              │
//!                 v                                             v
//!             discarded                               indexed / failed
//! ```
//!
//! # Lifecycle
//!
//! `Stopped ─start()─> Running ─stop()─> SoftStopping ─(timeout)─> HardStopping ─> Stopped`
//!
//! While soft stopping no new records are accepted, but everything already
//! buffered is still shipped. If that takes longer than the stop timeout the
//! shipper switches to hard stopping: the thread abandons the batch it is
//! retrying and exits, and whatever is left in the buffer is lost.
//!
//! # Failures
//!
//! A batch the sink could not accept as a whole is retried after
//! `failure_pause`, for as long as it takes or until a hard stop. Records
//! rejected individually are counted as failed and dropped. Only the first
//! failure of a streak and the following recovery are logged.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::ShipperConfig;
use crate::errors::{QueueError, ShipperError};
use crate::logger::ShipperLogger;
use crate::ring_buffer::FramedRingBuffer;
use crate::sink::{BatchOutcome, Sink};
use crate::stats::{now_millis, Statistics, StatsSnapshot};

static NEXT_THREAD_NR: AtomicUsize = AtomicUsize::new(0);

/// Lifecycle state of a [`Shipper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipperState {
    Stopped,
    Running,
    /// No new records are accepted, buffered ones are still shipped.
    SoftStopping,
    /// The shipping thread is abandoning its work.
    HardStopping,
}

/// State shared between the control surface, producers and the shipping
/// thread.
///
/// The flags are read without any lock; they are best-effort signals, not a
/// linearizable view of the lifecycle.
struct Shared {
    config: ShipperConfig,
    buffer: FramedRingBuffer,
    stats: Statistics,
    sink: Arc<dyn Sink>,
    logger: Arc<dyn ShipperLogger>,
    started: AtomicBool,
    soft_stopping: AtomicBool,
    hard_stopping: AtomicBool,
    /// Incremented on every start, so a thread left over from a previous run
    /// that never exited does not keep shipping.
    run_id: AtomicU64,
}

struct Worker {
    handle: JoinHandle<()>,
    done_rx: mpsc::Receiver<()>,
}

/// Decouples producers from a slow or unavailable [`Sink`].
pub struct Shipper {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Shipper {
    /// Creates a stopped shipper. The ring buffer is allocated here.
    ///
    /// # Errors
    ///
    /// Returns [`ShipperError::InvalidConfig`] if `config` does not validate.
    pub fn new(
        config: ShipperConfig,
        sink: Arc<dyn Sink>,
        logger: Arc<dyn ShipperLogger>,
    ) -> Result<Self, ShipperError> {
        config.validate()?;
        let shared = Shared {
            buffer: FramedRingBuffer::new(config.capacity_bytes),
            stats: Statistics::new(config.window_slot_size, config.window_slot_count),
            config,
            sink,
            logger,
            started: AtomicBool::new(false),
            soft_stopping: AtomicBool::new(false),
            hard_stopping: AtomicBool::new(false),
            run_id: AtomicU64::new(0),
        };
        Ok(Shipper {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        })
    }

    #[allow(clippy::expect_used)]
    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().expect("lock poisoned")
    }

    /// Starts the shipping thread. Does nothing if already running.
    ///
    /// The buffer and the statistics are cleared. Returns as soon as the
    /// thread is spawned.
    ///
    /// # Errors
    ///
    /// Returns [`ShipperError::Spawn`] if the thread could not be spawned.
    pub fn start(&self) -> Result<(), ShipperError> {
        let mut worker = self.lock_worker();
        if self.shared.started.load(Ordering::Acquire) {
            return Ok(());
        }

        self.shared.soft_stopping.store(false, Ordering::Release);
        self.shared.hard_stopping.store(false, Ordering::Release);
        self.shared.buffer.reset();
        self.shared.stats.reset();
        let run_id = self.shared.run_id.fetch_add(1, Ordering::AcqRel) + 1;

        let thread_name = self.shared.config.thread_name.clone().unwrap_or_else(|| {
            format!(
                "bulk-shipper-{}-{}",
                self.shared.config.name,
                NEXT_THREAD_NR.fetch_add(1, Ordering::Relaxed)
            )
        });

        let (done_tx, done_rx) = mpsc::channel();
        let shipping_loop = ShippingLoop {
            shared: Arc::clone(&self.shared),
            run_id,
            failing: false,
            done_tx,
        };
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || shipping_loop.run())?;

        debug!("Started shipping thread {thread_name}");
        self.shared.started.store(true, Ordering::Release);
        *worker = Some(Worker { handle, done_rx });
        Ok(())
    }

    /// Stops the shipping thread. Does nothing if not running.
    ///
    /// New records are rejected from now on. Buffered records are shipped for
    /// up to `stop_timeout`; after that the thread is told to abandon its work
    /// and given `hard_stop_grace` to exit. Records still buffered then are
    /// dropped and counted as discarded.
    pub fn stop(&self) {
        let mut worker = self.lock_worker();
        let Some(Worker { handle, done_rx }) = worker.take() else {
            return;
        };
        let shared = &self.shared;
        let config = &shared.config;

        shared.soft_stopping.store(true, Ordering::Release);
        // puts that passed the running check before the flag was set land
        // before this, so the shipping thread still sees them
        shared.buffer.close();
        // wake the thread if it is pausing between retries
        handle.thread().unpark();

        let mut exited = wait_for_exit(&done_rx, config.stop_timeout);
        if !exited {
            shared.logger.warn(&format!(
                "Shipper {} did not ship its buffered records within {:?}, forcing stop",
                config.name, config.stop_timeout
            ));
            shared.hard_stopping.store(true, Ordering::Release);
            handle.thread().unpark();
            exited = wait_for_exit(&done_rx, config.hard_stop_grace);
        }

        if exited {
            if handle.join().is_err() {
                shared
                    .logger
                    .error(&format!("Shipping thread of shipper {} panicked", config.name));
            }
        } else {
            shared.logger.error(&format!(
                "Shipping thread of shipper {} did not exit within {:?}, detaching it",
                config.name, config.hard_stop_grace
            ));
        }

        let abandoned = shared.buffer.clear();
        if abandoned > 0 {
            shared.stats.record_discarded(now_millis(), abandoned as u64);
            shared.logger.warn(&format!(
                "Shipper {} stopped with {abandoned} records still buffered, discarding them",
                config.name
            ));
        }

        shared.started.store(false, Ordering::Release);
        debug!("Shipper {} stopped", config.name);
    }

    /// Queues one record, the concatenation of `segments`.
    ///
    /// Never blocks. If the shipper is not running or the buffer has no room,
    /// the record is dropped and counted as discarded.
    ///
    /// Every call ends up counted exactly once, as indexed, discarded or
    /// failed.
    pub fn queue(&self, segments: &[&[u8]]) {
        let shared = &self.shared;
        if !shared.started.load(Ordering::Acquire) || shared.soft_stopping.load(Ordering::Acquire)
        {
            shared.stats.record_discarded(now_millis(), 1);
            return;
        }

        match shared.buffer.put(segments) {
            Ok(()) => {}
            Err(QueueError::CapacityExceeded { .. } | QueueError::Closed) => {
                shared.stats.record_discarded(now_millis(), 1);
            }
            Err(QueueError::Codec(e)) => {
                shared.stats.record_discarded(now_millis(), 1);
                shared.logger.error(&format!("Discarding record: {e}"));
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> ShipperState {
        let shared = &self.shared;
        if !shared.started.load(Ordering::Acquire) {
            ShipperState::Stopped
        } else if shared.hard_stopping.load(Ordering::Acquire) {
            ShipperState::HardStopping
        } else if shared.soft_stopping.load(Ordering::Acquire) {
            ShipperState::SoftStopping
        } else {
            ShipperState::Running
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ShipperState::Running
    }

    /// Clears lifetime totals and rolling windows.
    pub fn reset_statistics(&self) {
        self.shared.stats.reset();
    }

    #[must_use]
    pub fn total_indexed(&self) -> u64 {
        self.shared.stats.total_indexed()
    }

    #[must_use]
    pub fn total_discarded(&self) -> u64 {
        self.shared.stats.total_discarded()
    }

    #[must_use]
    pub fn total_failed(&self) -> u64 {
        self.shared.stats.total_failed()
    }

    /// Records that never made it to the sink: discarded plus failed.
    #[must_use]
    pub fn total_lost(&self) -> u64 {
        self.total_discarded() + self.total_failed()
    }

    #[must_use]
    pub fn indexed_in_window(&self) -> u64 {
        self.shared.stats.indexed_in_window(now_millis())
    }

    #[must_use]
    pub fn discarded_in_window(&self) -> u64 {
        self.shared.stats.discarded_in_window(now_millis())
    }

    #[must_use]
    pub fn failed_in_window(&self) -> u64 {
        self.shared.stats.failed_in_window(now_millis())
    }

    #[must_use]
    pub fn lost_in_window(&self) -> u64 {
        self.discarded_in_window() + self.failed_in_window()
    }

    /// Number of records waiting in the buffer.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.shared.buffer.available_elements()
    }

    /// Fraction of the buffer's bytes in use.
    #[must_use]
    pub fn queue_fill_fraction(&self) -> f64 {
        self.shared.buffer.used_capacity_fraction()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.shared.stats;
        let now = now_millis();
        let discarded_in_window = stats.discarded_in_window(now);
        let failed_in_window = stats.failed_in_window(now);
        StatsSnapshot {
            total_indexed: stats.total_indexed(),
            total_discarded: stats.total_discarded(),
            total_failed: stats.total_failed(),
            total_lost: stats.total_discarded() + stats.total_failed(),
            indexed_in_window: stats.indexed_in_window(now),
            discarded_in_window,
            failed_in_window,
            lost_in_window: discarded_in_window + failed_in_window,
            window_ms: u64::try_from(stats.window().as_millis()).unwrap_or(u64::MAX),
            queue_length: self.queue_length(),
            queue_fill_fraction: self.queue_fill_fraction(),
        }
    }
}

impl Drop for Shipper {
    fn drop(&mut self) {
        // don't block, but make sure the thread does not outlive its owner
        let shared = &self.shared;
        shared.soft_stopping.store(true, Ordering::Release);
        shared.hard_stopping.store(true, Ordering::Release);
        shared.buffer.close();
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                worker.handle.thread().unpark();
            }
        }
    }
}

fn wait_for_exit(done_rx: &mpsc::Receiver<()>, timeout: Duration) -> bool {
    match done_rx.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

/// State owned by the shipping thread.
struct ShippingLoop {
    shared: Arc<Shared>,
    run_id: u64,
    /// Set from the first failure until the next fully successful batch.
    failing: bool,
    done_tx: mpsc::Sender<()>,
}

impl ShippingLoop {
    fn should_abort(&self) -> bool {
        self.shared.hard_stopping.load(Ordering::Acquire)
            || self.shared.run_id.load(Ordering::Acquire) != self.run_id
    }

    fn run(mut self) {
        debug!("Shipping loop started");
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;

        while !self.should_abort() {
            let records = shared.buffer.drain(
                config.max_bulk_document_count,
                config.max_bulk_memory_size,
                Some(config.poll_interval),
            );
            if self.should_abort() {
                if !records.is_empty() {
                    shared.stats.record_failed(now_millis(), records.len() as u64);
                    debug!("Abandoning batch of {} records on hard stop", records.len());
                }
                break;
            }
            if records.is_empty() {
                // once closed nothing new arrives, so empty means done
                if shared.buffer.is_closed() && shared.buffer.available_elements() == 0 {
                    break;
                }
                continue;
            }
            self.process_batch(&records);
        }

        debug!("Shipping loop stopped");
        // the receiver is gone if stop() gave up waiting
        let _ = self.done_tx.send(());
    }

    fn process_batch(&mut self, records: &[Vec<u8>]) {
        let shared = Arc::clone(&self.shared);
        let batch_size = records.len();
        debug!("Shipping batch of {batch_size} records");

        loop {
            let outcome = shared.sink.process_batch(records);
            let now = now_millis();
            match outcome {
                BatchOutcome::Success => {
                    shared.stats.record_indexed(now, batch_size as u64);
                    if self.failing {
                        shared
                            .logger
                            .info("Shipping successful for the first time after a failure");
                        self.failing = false;
                    }
                    return;
                }
                BatchOutcome::PartialFailure {
                    failed_count,
                    error_message,
                    first_failure_detail,
                } => {
                    let failed = failed_count.min(batch_size);
                    shared.stats.record_failed(now, failed as u64);
                    shared.stats.record_indexed(now, (batch_size - failed) as u64);
                    if !self.failing {
                        let mut message = format!(
                            "Errors in bulk request. Bulk contained {batch_size} records, \
                             {failed} failed. Bulk error message: {error_message}."
                        );
                        if let Some(detail) = first_failure_detail {
                            message.push_str(&format!(" Error of first failed item: {detail}."));
                        }
                        shared
                            .logger
                            .warn(&format!("{message} Continuing, but suppressing log output"));
                        self.failing = true;
                    }
                    return;
                }
                BatchOutcome::TransientFailure { error_message } => {
                    if !self.failing {
                        shared.logger.error(&format!(
                            "Failed to ship batch of {batch_size} records: {error_message}. \
                             Retrying every {:?}, but suppressing log output",
                            shared.config.failure_pause
                        ));
                        self.failing = true;
                    }
                    if !self.pause_before_retry() {
                        shared.stats.record_failed(now_millis(), batch_size as u64);
                        debug!("Abandoning batch of {batch_size} records on hard stop");
                        return;
                    }
                    debug!("Retrying batch of {batch_size} records");
                }
            }
        }
    }

    /// Sleeps for `failure_pause`. Returns false if a hard stop was requested
    /// before or during the pause.
    fn pause_before_retry(&self) -> bool {
        let deadline = Instant::now() + self.shared.config.failure_pause;
        loop {
            if self.should_abort() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            // stop() unparks the thread; spurious wake-ups loop around
            thread::park_timeout(deadline - now);
        }
    }
}
