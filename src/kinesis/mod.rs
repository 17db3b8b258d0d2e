//! Kinesis sink: error classification, the batch-put seam, and the
//! publisher that owns retry, drop, and frontier emission.

pub mod classify;
pub mod publisher;
pub mod sink;

pub use classify::{classify, Disposition};
pub use publisher::{KinesisPublisher, RetryConfig};
pub use sink::{create_kinesis_client, KinesisSink, RecordOutcome, RecordSink, SinkFailure, SinkRecord};
