// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A [`Sink`] posting records to a `_bulk` index endpoint.
//!
//! Every queued record carries its target index in a small header:
//!
//! ```text
//! +----------------+------------------+-------------------------+
//! | u16 BE length  | index name UTF-8 | payload (one JSON line) |
//! +----------------+------------------+-------------------------+
//! ```
//!
//! Producers build the header once with [`index_record_header`] and queue
//! `&[&header, payload]`, so the record is framed without copying the
//! payload. A batch becomes one newline-delimited request with an
//! `{"index":{"_index":…}}` action line before each payload.

use std::collections::HashMap;
use std::str;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::BulkError;
use crate::sink::{BatchOutcome, Sink};

const INDEX_LEN_SIZE: usize = 2;
const MAX_ERROR_BODY_LEN: usize = 512;

/// Builds the header naming `index` as the target of a record.
///
/// # Errors
///
/// Returns [`BulkError::IndexTooLong`] if the name does not fit a `u16`
/// length.
pub fn index_record_header(index: &str) -> Result<Vec<u8>, BulkError> {
    let length = u16::try_from(index.len()).map_err(|_| BulkError::IndexTooLong(index.len()))?;
    let mut header = Vec::with_capacity(INDEX_LEN_SIZE + index.len());
    header.extend_from_slice(&length.to_be_bytes());
    header.extend_from_slice(index.as_bytes());
    Ok(header)
}

/// Splits a record into its index name and payload.
pub fn split_index_record(record: &[u8]) -> Result<(&str, &[u8]), BulkError> {
    if record.len() < INDEX_LEN_SIZE {
        return Err(BulkError::TruncatedRecord(record.len()));
    }
    let (length, rest) = record.split_at(INDEX_LEN_SIZE);
    let length = usize::from(u16::from_be_bytes([length[0], length[1]]));
    if rest.len() < length {
        return Err(BulkError::TruncatedRecord(record.len()));
    }
    let (index, payload) = rest.split_at(length);
    Ok((str::from_utf8(index)?, payload))
}

#[derive(Serialize)]
struct IndexAction<'a> {
    index: IndexTarget<'a>,
}

#[derive(Serialize)]
struct IndexTarget<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Deserialize)]
struct BulkItem {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl BulkItem {
    fn failed(&self) -> bool {
        self.status >= 300 || self.error.is_some()
    }

    fn describe_error(&self) -> String {
        match &self.error {
            Some(serde_json::Value::Object(error)) => {
                match (error.get("type"), error.get("reason")) {
                    (Some(kind), Some(reason)) => format!(
                        "{}: {}",
                        kind.as_str().unwrap_or_default(),
                        reason.as_str().unwrap_or_default()
                    ),
                    _ => serde_json::Value::Object(error.clone()).to_string(),
                }
            }
            Some(error) => error.to_string(),
            None => format!("status {}", self.status),
        }
    }
}

/// Request body for one batch, plus what could not be put into it.
struct BulkRequest {
    body: Vec<u8>,
    documents: usize,
    undecodable: usize,
    first_decode_error: Option<String>,
}

impl BulkRequest {
    fn build(records: &[Vec<u8>]) -> Self {
        let payload_len: usize = records.iter().map(Vec::len).sum();
        let mut request = BulkRequest {
            body: Vec::with_capacity(payload_len + 64 * records.len()),
            documents: 0,
            undecodable: 0,
            first_decode_error: None,
        };

        for record in records {
            let action = split_index_record(record).and_then(|(index, payload)| {
                let action = serde_json::to_vec(&IndexAction {
                    index: IndexTarget { index },
                })?;
                Ok((action, payload))
            });
            match action {
                Ok((action, payload)) => {
                    request.body.extend_from_slice(&action);
                    request.body.push(b'\n');
                    request.body.extend_from_slice(payload);
                    request.body.push(b'\n');
                    request.documents += 1;
                }
                Err(e) => {
                    request.undecodable += 1;
                    request.first_decode_error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        request
    }

    fn outcome(self, rejected: usize, first_rejection: Option<String>) -> BatchOutcome {
        if rejected == 0 && self.undecodable == 0 {
            return BatchOutcome::Success;
        }

        let mut reasons = Vec::new();
        if rejected > 0 {
            reasons.push(format!(
                "{rejected} of {} documents rejected by the cluster",
                self.documents
            ));
        }
        if self.undecodable > 0 {
            reasons.push(format!("{} records could not be decoded", self.undecodable));
        }
        BatchOutcome::PartialFailure {
            failed_count: rejected + self.undecodable,
            error_message: reasons.join(", "),
            first_failure_detail: first_rejection.or(self.first_decode_error),
        }
    }
}

/// Connection settings of a [`BulkIndexSink`].
#[derive(Debug, Clone)]
pub struct BulkSinkConfig {
    /// Base URL of the cluster, `/_bulk` is appended
    pub url: String,
    pub https_proxy: Option<String>,
    pub timeout: Duration,
}

/// Ships batches as bulk index requests over HTTP.
#[derive(Debug, Clone)]
pub struct BulkIndexSink {
    client: Client,
    endpoint: String,
}

impl BulkIndexSink {
    /// # Errors
    ///
    /// Returns [`BulkError::Client`] if the proxy URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: BulkSinkConfig) -> Result<Self, BulkError> {
        let mut builder = Client::builder().timeout(config.timeout);
        if let Some(proxy) = &config.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
        Ok(BulkIndexSink {
            client: builder.build()?,
            endpoint: format!("{}/_bulk", config.url.trim_end_matches('/')),
        })
    }

    fn submit(&self, mut request: BulkRequest) -> BatchOutcome {
        let body = std::mem::take(&mut request.body);
        let response = match self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
        {
            Ok(response) => response,
            Err(e) => {
                return BatchOutcome::TransientFailure {
                    error_message: format!("bulk request to {} failed: {e}", self.endpoint),
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().unwrap_or_default();
            if body.len() > MAX_ERROR_BODY_LEN {
                let mut end = MAX_ERROR_BODY_LEN;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return BatchOutcome::TransientFailure {
                error_message: format!("bulk request returned {status}: {body}"),
            };
        }

        let bulk_response = match response.json::<BulkResponse>() {
            Ok(bulk_response) => bulk_response,
            Err(e) => {
                return BatchOutcome::TransientFailure {
                    error_message: format!("could not read bulk response: {e}"),
                }
            }
        };

        let mut rejected = 0;
        let mut first_rejection = None;
        if bulk_response.errors {
            for item in bulk_response.items.iter().flat_map(HashMap::values) {
                if item.failed() {
                    rejected += 1;
                    first_rejection.get_or_insert_with(|| item.describe_error());
                }
            }
        }
        debug!(
            "Bulk request of {} documents done, {rejected} rejected",
            request.documents
        );
        request.outcome(rejected, first_rejection)
    }
}

impl Sink for BulkIndexSink {
    fn process_batch(&self, records: &[Vec<u8>]) -> BatchOutcome {
        let request = BulkRequest::build(records);
        if request.documents == 0 {
            // nothing left to send
            return request.outcome(0, None);
        }
        self.submit(request)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(index: &str, payload: &str) -> Vec<u8> {
        let mut record = index_record_header(index).unwrap();
        record.extend_from_slice(payload.as_bytes());
        record
    }

    fn sink_for(server: &mockito::Server) -> BulkIndexSink {
        BulkIndexSink::new(BulkSinkConfig {
            url: server.url(),
            https_proxy: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_index_record_header() {
        assert_eq!(index_record_header("logs").unwrap(), b"\x00\x04logs");
        assert_eq!(index_record_header("").unwrap(), b"\x00\x00");

        let too_long = "x".repeat(usize::from(u16::MAX) + 1);
        assert!(matches!(
            index_record_header(&too_long),
            Err(BulkError::IndexTooLong(65536))
        ));
    }

    #[test]
    fn test_split_index_record() {
        let record = record("logs-2024", r#"{"msg":"hi"}"#);
        let (index, payload) = split_index_record(&record).unwrap();
        assert_eq!(index, "logs-2024");
        assert_eq!(payload, br#"{"msg":"hi"}"#);

        assert!(matches!(
            split_index_record(b"\x00"),
            Err(BulkError::TruncatedRecord(1))
        ));
        assert!(matches!(
            split_index_record(b"\x00\x09abc"),
            Err(BulkError::TruncatedRecord(5))
        ));
        assert!(matches!(
            split_index_record(b"\x00\x01\xff{}"),
            Err(BulkError::InvalidIndex(_))
        ));
    }

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let sink = BulkIndexSink::new(BulkSinkConfig {
            url: "http://localhost:9200/".to_string(),
            https_proxy: None,
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(sink.endpoint, "http://localhost:9200/_bulk");
    }

    #[test]
    fn test_invalid_proxy() {
        let result = BulkIndexSink::new(BulkSinkConfig {
            url: "http://localhost:9200".to_string(),
            https_proxy: Some("not a proxy url".to_string()),
            timeout: Duration::from_secs(1),
        });
        assert!(matches!(result, Err(BulkError::Client(_))));
    }

    #[test]
    fn test_success() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/_bulk")
            .match_header("content-type", "application/x-ndjson")
            .match_body(concat!(
                r#"{"index":{"_index":"logs"}}"#,
                "\n",
                r#"{"msg":"one"}"#,
                "\n",
                r#"{"index":{"_index":"audit"}}"#,
                "\n",
                r#"{"msg":"two"}"#,
                "\n",
            ))
            .with_status(200)
            .with_body(concat!(
                r#"{"took":3,"errors":false,"items":["#,
                r#"{"index":{"status":201}},{"index":{"status":201}}]}"#
            ))
            .create();

        let sink = sink_for(&server);
        let outcome = sink.process_batch(&[
            record("logs", r#"{"msg":"one"}"#),
            record("audit", r#"{"msg":"two"}"#),
        ]);

        mock.assert();
        assert_eq!(outcome, BatchOutcome::Success);
    }

    #[test]
    fn test_partial_failure() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/_bulk")
            .with_status(200)
            .with_body(
                r#"{"errors":true,"items":[
                    {"index":{"status":201}},
                    {"index":{"status":400,"error":{"type":"mapper_parsing_exception","reason":"failed to parse field [level]"}}},
                    {"index":{"status":429,"error":{"type":"es_rejected_execution_exception","reason":"queue full"}}}
                ]}"#,
            )
            .create();

        let sink = sink_for(&server);
        let outcome = sink.process_batch(&[
            record("logs", "{}"),
            record("logs", "{}"),
            record("logs", "{}"),
        ]);

        mock.assert();
        assert_eq!(
            outcome,
            BatchOutcome::PartialFailure {
                failed_count: 2,
                error_message: "2 of 3 documents rejected by the cluster".to_string(),
                first_failure_detail: Some(
                    "mapper_parsing_exception: failed to parse field [level]".to_string()
                ),
            }
        );
    }

    #[test]
    fn test_server_error_is_transient() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/_bulk")
            .with_status(503)
            .with_body("cluster unavailable")
            .create();

        let sink = sink_for(&server);
        let outcome = sink.process_batch(&[record("logs", "{}")]);

        mock.assert();
        match outcome {
            BatchOutcome::TransientFailure { error_message } => {
                assert!(error_message.contains("503"));
                assert!(error_message.contains("cluster unavailable"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_unreadable_response_is_transient() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/_bulk")
            .with_status(200)
            .with_body("<html>proxy login</html>")
            .create();

        let sink = sink_for(&server);
        let outcome = sink.process_batch(&[record("logs", "{}")]);

        mock.assert();
        assert!(matches!(outcome, BatchOutcome::TransientFailure { .. }));
    }

    #[test]
    fn test_connection_refused_is_transient() {
        let sink = BulkIndexSink::new(BulkSinkConfig {
            url: "http://127.0.0.1:1".to_string(),
            https_proxy: None,
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        let outcome = sink.process_batch(&[record("logs", "{}")]);
        assert!(matches!(outcome, BatchOutcome::TransientFailure { .. }));
    }

    #[test]
    fn test_undecodable_records_are_failed() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/_bulk")
            .match_body(concat!(r#"{"index":{"_index":"logs"}}"#, "\n", "{}", "\n"))
            .with_status(200)
            .with_body(r#"{"errors":false,"items":[{"index":{"status":201}}]}"#)
            .create();

        let sink = sink_for(&server);
        let outcome = sink.process_batch(&[b"\x00".to_vec(), record("logs", "{}")]);

        mock.assert();
        match outcome {
            BatchOutcome::PartialFailure {
                failed_count,
                first_failure_detail,
                ..
            } => {
                assert_eq!(failed_count, 1);
                assert!(first_failure_detail.unwrap().contains("too short"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_batch_without_valid_records_is_not_sent() {
        let mut server = mockito::Server::new();
        let mock = server.mock("POST", "/_bulk").expect(0).create();

        let sink = sink_for(&server);
        let outcome = sink.process_batch(&[b"\x00\x05ab".to_vec()]);

        mock.assert();
        assert!(matches!(
            outcome,
            BatchOutcome::PartialFailure { failed_count: 1, .. }
        ));
    }
}
