// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock sinks and loggers

use bulk_shipper::{BatchOutcome, ShipperLogger, Sink};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Logger keeping every message for later assertions
#[derive(Default)]
pub struct RecordingLogger {
    messages: Mutex<Vec<(Level, String)>>,
}

#[allow(dead_code)]
impl RecordingLogger {
    pub fn messages(&self) -> Vec<(Level, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .count()
    }

    pub fn contains(&self, level: Level, text: &str) -> bool {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .any(|(l, message)| *l == level && message.contains(text))
    }
}

impl ShipperLogger for RecordingLogger {
    fn info(&self, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((Level::Info, message.to_string()));
    }

    fn warn(&self, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((Level::Warn, message.to_string()));
    }

    fn error(&self, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((Level::Error, message.to_string()));
    }
}

/// Sink answering with scripted outcomes, then `Success`, recording every
/// batch it is handed
#[derive(Default)]
pub struct ScriptedSink {
    outcomes: Mutex<VecDeque<BatchOutcome>>,
    batches: Mutex<Vec<Vec<Vec<u8>>>>,
    always_fail: AtomicBool,
}

#[allow(dead_code)]
impl ScriptedSink {
    pub fn new(outcomes: Vec<BatchOutcome>) -> Self {
        ScriptedSink {
            outcomes: Mutex::new(outcomes.into()),
            ..Default::default()
        }
    }

    /// Sink that never accepts anything
    pub fn unavailable() -> Self {
        let sink = ScriptedSink::default();
        sink.always_fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn batches(&self) -> Vec<Vec<Vec<u8>>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    /// Records of all calls in order, retries included
    pub fn records(&self) -> Vec<Vec<u8>> {
        self.batches.lock().unwrap().concat()
    }
}

impl Sink for ScriptedSink {
    fn process_batch(&self, records: &[Vec<u8>]) -> BatchOutcome {
        self.batches.lock().unwrap().push(records.to_vec());
        if self.always_fail.load(Ordering::SeqCst) {
            return BatchOutcome::TransientFailure {
                error_message: "connection refused".to_string(),
            };
        }
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BatchOutcome::Success)
    }
}
