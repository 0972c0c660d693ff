// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reporting of shipper state transitions.
//!
//! The shipper reports failures, recoveries and shutdown losses through
//! [`ShipperLogger`] so that it does not need to know which logging framework
//! the application uses. [`TracingLogger`] forwards everything to `tracing`.

/// Receives the shipper's state-transition messages.
pub trait ShipperLogger: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Emits messages as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl ShipperLogger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!(target: "bulk_shipper", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "bulk_shipper", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "bulk_shipper", "{message}");
    }
}
