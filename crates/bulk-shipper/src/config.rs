// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::codec::MAX_ENCODABLE_LENGTH;
use crate::errors::ShipperError;

const ENV_PREFIX: &str = "BULK_SHIPPER_";

/// Configuration of a [`Shipper`](crate::shipper::Shipper). Fixed once the
/// shipper is created.
#[derive(Debug, Clone, PartialEq)]
pub struct ShipperConfig {
    /// Name of the shipper, used to derive the worker thread name
    pub name: String,
    /// Explicit worker thread name, overrides the derived one
    pub thread_name: Option<String>,
    /// Ring buffer capacity in bytes, length prefixes included
    pub capacity_bytes: usize,
    /// Maximum number of records per batch
    pub max_bulk_document_count: usize,
    /// Maximum payload bytes per batch, `None` for no limit. Never applied to
    /// the first record of a batch.
    pub max_bulk_memory_size: Option<usize>,
    /// How long one drain waits for records before re-checking stop requests
    pub poll_interval: Duration,
    /// How long `stop()` lets the worker ship what is still buffered
    pub stop_timeout: Duration,
    /// How long `stop()` waits for the worker to exit after a hard stop
    pub hard_stop_grace: Duration,
    /// Pause between attempts to ship a batch the sink could not accept
    pub failure_pause: Duration,
    /// Slot size of the rolling statistics windows
    pub window_slot_size: Duration,
    /// Slot count of the rolling statistics windows
    pub window_slot_count: usize,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            thread_name: None,
            capacity_bytes: 10 * 1024 * 1024,
            max_bulk_document_count: 1000,
            max_bulk_memory_size: Some(1024 * 1024),
            poll_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
            hard_stop_grace: Duration::from_secs(4),
            failure_pause: Duration::from_secs(5),
            window_slot_size: Duration::from_secs(6),
            window_slot_count: 10,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|value| value.parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

impl ShipperConfig {
    /// Create configuration from `BULK_SHIPPER_*` environment variables.
    ///
    /// Unset or unparsable variables keep their default. Sizes are in bytes,
    /// durations in milliseconds, and a negative
    /// `BULK_SHIPPER_MAX_BULK_MEMORY_SIZE_BYTES` disables the batch size cap.
    pub fn from_env() -> Result<Self, ShipperError> {
        let defaults = Self::default();

        let max_bulk_memory_size = match env_parse::<i64>("MAX_BULK_MEMORY_SIZE_BYTES") {
            Some(size) if size < 0 => None,
            Some(size) => usize::try_from(size).ok().or(defaults.max_bulk_memory_size),
            None => defaults.max_bulk_memory_size,
        };

        let config = Self {
            name: env_var("NAME").unwrap_or(defaults.name),
            thread_name: env_var("THREAD_NAME").or(defaults.thread_name),
            capacity_bytes: env_parse("CAPACITY_BYTES").unwrap_or(defaults.capacity_bytes),
            max_bulk_document_count: env_parse("MAX_BULK_DOCUMENT_COUNT")
                .unwrap_or(defaults.max_bulk_document_count),
            max_bulk_memory_size,
            poll_interval: env_millis("POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            stop_timeout: env_millis("STOP_TIMEOUT_MS").unwrap_or(defaults.stop_timeout),
            hard_stop_grace: env_millis("HARD_STOP_GRACE_MS").unwrap_or(defaults.hard_stop_grace),
            failure_pause: env_millis("FAILURE_PAUSE_MS").unwrap_or(defaults.failure_pause),
            window_slot_size: env_millis("WINDOW_SLOT_SIZE_MS")
                .unwrap_or(defaults.window_slot_size),
            window_slot_count: env_parse("WINDOW_SLOT_COUNT")
                .unwrap_or(defaults.window_slot_count),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ShipperError> {
        if self.capacity_bytes == 0 {
            return Err(ShipperError::InvalidConfig(
                "buffer capacity must be greater than 0".to_string(),
            ));
        }

        // a record filling the whole buffer must still be framable
        if self.capacity_bytes > MAX_ENCODABLE_LENGTH {
            return Err(ShipperError::InvalidConfig(format!(
                "buffer capacity of {} bytes exceeds the maximum of {MAX_ENCODABLE_LENGTH} bytes",
                self.capacity_bytes
            )));
        }

        if self.max_bulk_document_count == 0 {
            return Err(ShipperError::InvalidConfig(
                "max bulk document count must be greater than 0".to_string(),
            ));
        }

        if self.max_bulk_memory_size == Some(0) {
            return Err(ShipperError::InvalidConfig(
                "max bulk memory size must be greater than 0, or unset for no limit".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ShipperError::InvalidConfig(
                "poll interval must be greater than 0".to_string(),
            ));
        }

        if self.window_slot_size < Duration::from_millis(1) || self.window_slot_count == 0 {
            return Err(ShipperError::InvalidConfig(
                "rolling window slot size must be at least 1ms and slot count greater than 0"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
