// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the shipper and its building blocks.

/// The length prefix of a record could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("record length {0} exceeds the maximum encodable length of 1073741823 bytes")]
    LengthOverflow(usize),
}

/// Reasons a record was not appended to the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("not enough free space: record needs {required} bytes, {free} bytes free")]
    CapacityExceeded { required: usize, free: usize },

    #[error("buffer is closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors surfaced by the shipper's control surface.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn shipping thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised while decoding or shipping bulk index records.
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("record of {0} bytes is too short to hold an index header")]
    TruncatedRecord(usize),

    #[error("index name is not valid UTF-8")]
    InvalidIndex(#[from] std::str::Utf8Error),

    #[error("index name of {0} bytes does not fit the record header")]
    IndexTooLong(usize),

    #[error("failed to encode bulk action: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
