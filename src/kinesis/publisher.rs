//! Publishes micro-batches to the sink and drives the ack frontier.
//!
//! Retry policy: retriable failures (whole-call or per-record) are retried
//! with exponential backoff and jitter up to `max_attempts`; non-retriable
//! failures and exhausted retries drop the affected records. A dropped
//! record is still marked published so a poison event can never stall the
//! frontier; the slot advancing past it is the documented durability trade.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pipeline::{AckTracker, ChangeEvent, InflightQueue, MicroBatcher};
use crate::postgres::Lsn;

use super::classify::{classify, Disposition};
use super::sink::{RecordOutcome, RecordSink, SinkRecord};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryConfig {
    /// Delay before attempt `n + 1`, after `n` failed attempts:
    /// `min(cap, base * multiplier^(n-1)) + jitter`, jitter uniform in
    /// `[0, delay)`.
    fn delay_after(&self, failed_attempts: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64
            * self.multiplier.powi(failed_attempts.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jitter = rand::rng().random_range(0.0..1.0) * capped;
        Duration::from_millis((capped + jitter) as u64)
    }
}

pub struct KinesisPublisher<S: RecordSink> {
    sink: S,
    batcher: MicroBatcher,
    retry: RetryConfig,
}

impl<S: RecordSink> KinesisPublisher<S> {
    pub fn new(sink: S, batcher: MicroBatcher, retry: RetryConfig) -> Self {
        Self {
            sink,
            batcher,
            retry,
        }
    }

    /// Drains the queue until cancelled. After every batch completion,
    /// including one that ended in a full drop, the current frontier is
    /// pushed to `frontier_tx` when it advanced.
    pub async fn run(
        mut self,
        queue: Arc<InflightQueue>,
        tracker: Arc<AckTracker>,
        frontier_tx: watch::Sender<u64>,
        cancel: CancellationToken,
    ) -> crate::Result<()> {
        let mut last_emitted = tracker.frontier_lsn();
        loop {
            let Some(batch) = self.batcher.next_batch(&queue, &cancel).await else {
                return Ok(());
            };
            if !self.publish_batch(batch, &queue, &tracker, &cancel).await {
                // Cancelled mid-publish: remaining events are deliberately
                // left unacked so the slot cannot advance past them.
                return Ok(());
            }

            let frontier = tracker.frontier_lsn();
            if frontier > last_emitted {
                last_emitted = frontier;
                if frontier_tx.send(frontier).is_err() {
                    debug!("frontier receiver dropped");
                }
            }
        }
    }

    /// Runs one batch through the retry state machine. Returns `false` when
    /// cancelled with records still unresolved.
    async fn publish_batch(
        &self,
        mut pending: Vec<ChangeEvent>,
        queue: &InflightQueue,
        tracker: &AckTracker,
        cancel: &CancellationToken,
    ) -> bool {
        let mut attempt = 1u32;
        loop {
            let records: Vec<SinkRecord> = pending
                .iter()
                .map(|event| SinkRecord {
                    partition_key: event.partition_key.clone(),
                    data: event.payload.clone(),
                })
                .collect();

            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = self.sink.put_records(&records) => result,
            };

            match result {
                Ok(outcomes) => {
                    let mut outcomes = outcomes.into_iter();
                    let mut retriable = Vec::new();
                    for event in std::mem::take(&mut pending) {
                        match outcomes.next() {
                            Some(RecordOutcome::Delivered) => {
                                tracker.mark_published_by_id(event.ack_id);
                                queue.task_done(event);
                            }
                            Some(RecordOutcome::Failed { code, message }) => {
                                match classify(&code, &message) {
                                    Disposition::Retriable => retriable.push(event),
                                    Disposition::NonRetriable => {
                                        self.drop_failed_event(event, &code, queue, tracker);
                                    }
                                }
                            }
                            // A short answer from the service leaves the
                            // record unresolved; retry it rather than
                            // assume delivery.
                            None => retriable.push(event),
                        }
                    }
                    if retriable.is_empty() {
                        return true;
                    }
                    pending = retriable;
                }
                Err(failure) => {
                    if classify(&failure.code, &failure.message) == Disposition::NonRetriable {
                        warn!(
                            code = %failure.code,
                            message = %failure.message,
                            records = pending.len(),
                            "kinesis_publish_failed_non_retriable"
                        );
                        self.drop_failed_events(pending, &failure.code, queue, tracker);
                        return true;
                    }
                    debug!(
                        code = %failure.code,
                        message = %failure.message,
                        attempt,
                        "kinesis_publish_attempt_failed"
                    );
                }
            }

            if attempt >= self.retry.max_attempts {
                warn!(
                    records = pending.len(),
                    attempts = attempt,
                    "kinesis_retry_exhausted"
                );
                self.drop_failed_events(pending, "RetryExhausted", queue, tracker);
                return true;
            }

            let delay = self.retry.delay_after(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                records = pending.len(),
                "kinesis_publish_retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn drop_failed_events(
        &self,
        events: Vec<ChangeEvent>,
        reason: &str,
        queue: &InflightQueue,
        tracker: &AckTracker,
    ) {
        for event in events {
            self.drop_failed_event(event, reason, queue, tracker);
        }
    }

    /// Discards an event while keeping the pipeline live: published from the
    /// frontier's point of view, capacity returned. A future dead-letter
    /// sink slots in here, acking only after the event is durably accepted
    /// elsewhere.
    fn drop_failed_event(
        &self,
        event: ChangeEvent,
        reason: &str,
        queue: &InflightQueue,
        tracker: &AckTracker,
    ) {
        warn!(
            ack_id = event.ack_id,
            lsn = %Lsn(event.lsn),
            size_bytes = event.approx_size_bytes,
            reason,
            "kinesis_records_dropped"
        );
        tracker.mark_published_by_id(event.ack_id);
        queue.task_done(event);
    }
}
