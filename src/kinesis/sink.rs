//! The sink seam and its Kinesis implementation.
//!
//! The publisher talks to [`RecordSink`] so tests (and an eventual
//! dead-letter path) can substitute their own transport. The production
//! implementation wraps `aws-sdk-kinesis` PutRecords with a per-attempt
//! timeout and maps per-record results onto [`RecordOutcome`].

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_kinesis::error::ProvideErrorMetadata;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::PutRecordsRequestEntry;
use aws_sdk_kinesis::Client;
use bytes::Bytes;
use tracing::warn;

/// One record handed to the sink's batch-put operation.
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub partition_key: String,
    pub data: Bytes,
}

/// Per-record result of a batch-put that reached the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Delivered,
    Failed { code: String, message: String },
}

/// Whole-call failure: nothing in the batch was accepted.
#[derive(Debug, Clone)]
pub struct SinkFailure {
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for SinkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Sends the batch and returns one outcome per input record, in input
    /// order. `Err` means the call as a whole failed.
    async fn put_records(
        &self,
        records: &[SinkRecord],
    ) -> std::result::Result<Vec<RecordOutcome>, SinkFailure>;
}

#[async_trait]
impl<S: RecordSink + ?Sized> RecordSink for std::sync::Arc<S> {
    async fn put_records(
        &self,
        records: &[SinkRecord],
    ) -> std::result::Result<Vec<RecordOutcome>, SinkFailure> {
        self.as_ref().put_records(records).await
    }
}

/// Builds a Kinesis client from the ambient AWS configuration chain, with
/// an optional explicit region override.
pub async fn create_kinesis_client(region: Option<String>) -> Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region));
    }
    let sdk_config = loader.load().await;
    Client::new(&sdk_config)
}

pub struct KinesisSink {
    client: Client,
    stream_name: String,
    request_timeout: Duration,
}

impl KinesisSink {
    pub fn new(client: Client, stream_name: String, request_timeout: Duration) -> Self {
        Self {
            client,
            stream_name,
            request_timeout,
        }
    }
}

#[async_trait]
impl RecordSink for KinesisSink {
    async fn put_records(
        &self,
        records: &[SinkRecord],
    ) -> std::result::Result<Vec<RecordOutcome>, SinkFailure> {
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let entry = PutRecordsRequestEntry::builder()
                .partition_key(&record.partition_key)
                .data(Blob::new(record.data.to_vec()))
                .build()
                .map_err(|e| SinkFailure {
                    code: "InvalidArgument".to_string(),
                    message: e.to_string(),
                })?;
            entries.push(entry);
        }

        let request = self
            .client
            .put_records()
            .stream_name(&self.stream_name)
            .set_records(Some(entries))
            .send();

        let response = match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(SinkFailure {
                    code: e.code().unwrap_or("Unknown").to_string(),
                    message: e.message().unwrap_or("no message").to_string(),
                });
            }
            Err(_) => {
                return Err(SinkFailure {
                    code: "RequestTimeout".to_string(),
                    message: format!(
                        "PutRecords did not complete within {:?}",
                        self.request_timeout
                    ),
                });
            }
        };

        let results = response.records();
        if results.len() != records.len() {
            warn!(
                sent = records.len(),
                returned = results.len(),
                "kinesis_put_records_result_count_mismatch"
            );
        }

        Ok(results
            .iter()
            .map(|entry| match entry.error_code() {
                Some(code) => RecordOutcome::Failed {
                    code: code.to_string(),
                    message: entry.error_message().unwrap_or("no message").to_string(),
                },
                None => RecordOutcome::Delivered,
            })
            .collect())
    }
}
