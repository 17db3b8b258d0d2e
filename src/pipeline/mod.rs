//! In-process pipeline between the replication reader and the sink
//! publisher: event type, bounded inflight queue, acknowledgement frontier,
//! and micro-batching.

pub mod ack;
pub mod batcher;
pub mod queue;
pub mod types;

pub use ack::AckTracker;
pub use batcher::{BatchConfig, MicroBatcher};
pub use queue::InflightQueue;
pub use types::ChangeEvent;
