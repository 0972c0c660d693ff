// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The destination batches are shipped to.

/// Result of handing one batch to a [`Sink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every record was accepted.
    Success,
    /// The request went through but some records were rejected individually.
    /// Rejected records are not retried.
    PartialFailure {
        failed_count: usize,
        error_message: String,
        first_failure_detail: Option<String>,
    },
    /// The batch as a whole could not be delivered and should be retried.
    TransientFailure { error_message: String },
}

/// Durably accepts batches of records.
///
/// Implementations are called from the shipping thread only, one batch at a
/// time. The same batch is handed over again after a
/// [`BatchOutcome::TransientFailure`].
pub trait Sink: Send + Sync {
    fn process_batch(&self, records: &[Vec<u8>]) -> BatchOutcome;
}

impl<F> Sink for F
where
    F: Fn(&[Vec<u8>]) -> BatchOutcome + Send + Sync,
{
    fn process_batch(&self, records: &[Vec<u8>]) -> BatchOutcome {
        self(records)
    }
}
