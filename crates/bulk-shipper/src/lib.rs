// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Non-blocking hand-off of log events to a bulk indexing backend.
//!
//! Application threads [`queue`](Shipper::queue) serialized records into a
//! bounded, byte-oriented ring buffer and never wait on the network. A
//! background thread drains the buffer in batches and ships them through a
//! [`Sink`]; when the buffer is full or the shipper is stopped, records are
//! dropped and counted instead of blocking the caller.

pub mod bulk;
pub mod codec;
pub mod config;
pub mod errors;
pub mod logger;
pub mod ring_buffer;
pub mod rolling_counter;
pub mod shipper;
pub mod sink;
pub mod stats;

pub use bulk::{index_record_header, BulkIndexSink, BulkSinkConfig};
pub use config::ShipperConfig;
pub use errors::{BulkError, CodecError, QueueError, ShipperError};
pub use logger::{ShipperLogger, TracingLogger};
pub use ring_buffer::FramedRingBuffer;
pub use rolling_counter::RollingEventCounter;
pub use shipper::{Shipper, ShipperState};
pub use sink::{BatchOutcome, Sink};
pub use stats::StatsSnapshot;
