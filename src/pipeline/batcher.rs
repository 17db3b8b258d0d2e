//! Shapes the queue's event stream into sink batches.
//!
//! Three caps apply simultaneously: record count, aggregate bytes, and a
//! linger deadline measured from the batch's first event. The batch is
//! emitted as soon as any cap is hit; an empty batch is never produced.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::queue::InflightQueue;
use super::types::ChangeEvent;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_records: usize,
    pub max_bytes: usize,
    pub max_linger: Duration,
}

pub struct MicroBatcher {
    config: BatchConfig,
    /// Event pulled from the queue that would have pushed the previous
    /// batch over its byte cap; it opens the next batch instead.
    carry: Option<ChangeEvent>,
}

// Poll granularity while waiting for a batch to open; bounds how long
// cancellation can go unnoticed on an idle queue.
const IDLE_POLL: Duration = Duration::from_millis(250);

impl MicroBatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            carry: None,
        }
    }

    /// Waits for at least one event and returns a batch shaped by the caps.
    /// Returns `None` only when cancelled before a batch opened.
    pub async fn next_batch(
        &mut self,
        queue: &InflightQueue,
        cancel: &CancellationToken,
    ) -> Option<Vec<ChangeEvent>> {
        let first = match self.carry.take() {
            Some(event) => event,
            None => loop {
                if cancel.is_cancelled() {
                    return None;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    got = queue.get_ready(IDLE_POLL) => {
                        if let Some(event) = got {
                            break event;
                        }
                    }
                }
            },
        };

        let mut bytes = first.approx_size_bytes;
        let mut batch = vec![first];
        let deadline = Instant::now() + self.config.max_linger;

        while batch.len() < self.config.max_records && bytes < self.config.max_bytes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                got = queue.get_ready(remaining) => {
                    let Some(event) = got else { break };
                    if bytes + event.approx_size_bytes > self.config.max_bytes {
                        self.carry = Some(event);
                        break;
                    }
                    bytes += event.approx_size_bytes;
                    batch.push(event);
                }
            }
        }

        Some(batch)
    }
}
