//! End-to-end pipeline scenarios with the real queue, tracker, batcher, and
//! publisher wired to a scripted in-memory sink.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use pg_kinesis_relay::kinesis::{
    KinesisPublisher, RecordOutcome, RecordSink, RetryConfig, SinkFailure, SinkRecord,
};
use pg_kinesis_relay::pipeline::{
    AckTracker, BatchConfig, ChangeEvent, InflightQueue, MicroBatcher,
};

/// One scripted response per put_records call; once the script is empty
/// every record is delivered.
enum Scripted {
    AllDelivered,
    Outcomes(Vec<RecordOutcome>),
    Failure(SinkFailure),
}

#[derive(Default)]
struct ScriptedSink {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<usize>>,
}

impl ScriptedSink {
    fn with_script(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSink for ScriptedSink {
    async fn put_records(
        &self,
        records: &[SinkRecord],
    ) -> std::result::Result<Vec<RecordOutcome>, SinkFailure> {
        self.calls.lock().unwrap().push(records.len());
        match self.script.lock().unwrap().pop_front() {
            None | Some(Scripted::AllDelivered) => {
                Ok(vec![RecordOutcome::Delivered; records.len()])
            }
            Some(Scripted::Outcomes(outcomes)) => Ok(outcomes),
            Some(Scripted::Failure(failure)) => Err(failure),
        }
    }
}

struct Harness {
    queue: Arc<InflightQueue>,
    tracker: Arc<AckTracker>,
    frontier_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
    publisher: tokio::task::JoinHandle<pg_kinesis_relay::Result<()>>,
}

fn retry_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
    }
}

fn start_pipeline(sink: Arc<ScriptedSink>, initial_lsn: u64, max_attempts: u32) -> Harness {
    let queue = Arc::new(InflightQueue::new(100, 10_000_000));
    let tracker = Arc::new(AckTracker::new(initial_lsn));
    let (frontier_tx, frontier_rx) = watch::channel(initial_lsn);
    let cancel = CancellationToken::new();

    let batcher = MicroBatcher::new(BatchConfig {
        max_records: 100,
        max_bytes: 1_000_000,
        max_linger: Duration::from_millis(20),
    });
    let publisher = KinesisPublisher::new(sink, batcher, retry_config(max_attempts));
    let task = tokio::spawn(publisher.run(
        queue.clone(),
        tracker.clone(),
        frontier_tx,
        cancel.clone(),
    ));

    Harness {
        queue,
        tracker,
        frontier_rx,
        cancel,
        publisher: task,
    }
}

impl Harness {
    async fn feed(&self, lsn: u64) {
        let ack_id = self.tracker.register(lsn);
        let event = ChangeEvent::new(
            lsn,
            ack_id,
            Bytes::from(format!("{{\"lsn\":{lsn}}}")),
            lsn.to_string(),
        );
        self.queue.put(event).await;
    }

    async fn wait_for_frontier(&mut self, lsn: u64) {
        tokio::time::timeout(
            Duration::from_secs(2),
            self.frontier_rx.wait_for(|v| *v >= lsn),
        )
        .await
        .expect("frontier did not advance in time")
        .expect("frontier channel closed");
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.publisher.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn happy_path_publishes_in_order_and_advances_frontier() {
    let sink = Arc::new(ScriptedSink::default());
    let mut harness = start_pipeline(sink.clone(), 0, 3);

    for lsn in (100..=190).step_by(10) {
        harness.feed(lsn).await;
    }

    harness.wait_for_frontier(190).await;
    assert_eq!(harness.tracker.frontier_lsn(), 190);
    assert_eq!(harness.tracker.pending_count(), 0);
    // Every put has been matched by task_done.
    assert_eq!(harness.queue.inflight(), (0, 0));
    assert_eq!(sink.call_sizes().iter().sum::<usize>(), 10);

    harness.stop().await;
}

#[tokio::test]
async fn retriable_stream_failure_recovers_with_backoff() {
    let retriable = || SinkFailure {
        code: "ProvisionedThroughputExceededException".to_string(),
        message: "Rate exceeded".to_string(),
    };
    let sink = Arc::new(ScriptedSink::with_script(vec![
        Scripted::Failure(retriable()),
        Scripted::Failure(retriable()),
        Scripted::AllDelivered,
    ]));
    let mut harness = start_pipeline(sink.clone(), 0, 3);

    let start = Instant::now();
    for lsn in [100, 110, 120, 130, 140] {
        harness.feed(lsn).await;
    }

    harness.wait_for_frontier(140).await;
    // Two failed attempts, then success: three calls, each with the full
    // pending set, and at least the two un-jittered backoff delays elapsed.
    assert_eq!(sink.call_sizes(), vec![5, 5, 5]);
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(harness.queue.inflight(), (0, 0));
    assert_eq!(harness.tracker.pending_count(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn non_retriable_record_is_dropped_without_stalling_the_frontier() {
    let sink = Arc::new(ScriptedSink::with_script(vec![Scripted::Outcomes(vec![
        RecordOutcome::Delivered,
        RecordOutcome::Failed {
            code: "ValidationException".to_string(),
            message: "1 validation error detected".to_string(),
        },
        RecordOutcome::Delivered,
    ])]));
    let mut harness = start_pipeline(sink.clone(), 0, 3);

    for lsn in [100, 110, 120] {
        harness.feed(lsn).await;
    }

    // The dropped middle record still counts as published, so the frontier
    // reaches the batch maximum.
    harness.wait_for_frontier(120).await;
    assert_eq!(sink.call_sizes(), vec![3]);
    assert_eq!(harness.queue.inflight(), (0, 0));
    assert_eq!(harness.tracker.pending_count(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn per_record_retriable_failures_are_retried_alone() {
    let sink = Arc::new(ScriptedSink::with_script(vec![
        Scripted::Outcomes(vec![
            RecordOutcome::Delivered,
            RecordOutcome::Failed {
                code: "ProvisionedThroughputExceededException".to_string(),
                message: "Rate exceeded".to_string(),
            },
        ]),
        Scripted::AllDelivered,
    ]));
    let mut harness = start_pipeline(sink.clone(), 0, 3);

    harness.feed(100).await;
    harness.feed(110).await;

    harness.wait_for_frontier(110).await;
    // The second call carries only the throttled record.
    assert_eq!(sink.call_sizes(), vec![2, 1]);
    assert_eq!(harness.queue.inflight(), (0, 0));

    harness.stop().await;
}

#[tokio::test]
async fn retry_exhaustion_drops_the_remainder_and_advances() {
    let retriable = || SinkFailure {
        code: "InternalFailure".to_string(),
        message: "Internal service error".to_string(),
    };
    let sink = Arc::new(ScriptedSink::with_script(vec![
        Scripted::Failure(retriable()),
        Scripted::Failure(retriable()),
        Scripted::Failure(retriable()),
    ]));
    let mut harness = start_pipeline(sink.clone(), 0, 2);

    harness.feed(100).await;
    harness.feed(110).await;

    // Both records are dropped after the attempt budget, which still
    // advances the frontier: liveness over durability.
    harness.wait_for_frontier(110).await;
    assert_eq!(sink.call_sizes(), vec![2, 2]);
    assert_eq!(harness.queue.inflight(), (0, 0));
    assert_eq!(harness.tracker.pending_count(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn non_retriable_stream_failure_drops_the_whole_batch_without_retry() {
    let sink = Arc::new(ScriptedSink::with_script(vec![Scripted::Failure(
        SinkFailure {
            code: "ResourceNotFoundException".to_string(),
            message: "Stream orders not found".to_string(),
        },
    )]));
    let mut harness = start_pipeline(sink.clone(), 0, 5);

    harness.feed(100).await;
    harness.feed(110).await;

    harness.wait_for_frontier(110).await;
    // Fail-fast: exactly one call, no retries.
    assert_eq!(sink.call_sizes(), vec![2]);
    assert_eq!(harness.queue.inflight(), (0, 0));

    harness.stop().await;
}

#[tokio::test]
async fn failover_replays_from_the_slot_checkpoint() {
    // First leader cycle: five events published, frontier at 150 inside the
    // tracker, but the slot never heard about it.
    let sink = Arc::new(ScriptedSink::default());
    let mut harness = start_pipeline(sink.clone(), 0, 3);
    for lsn in [110, 120, 130, 140, 150] {
        harness.feed(lsn).await;
    }
    harness.wait_for_frontier(150).await;
    harness.stop().await;

    // New cycle starts from the stale slot checkpoint and re-reads the same
    // WAL range: duplicates at the sink, no loss, frontier recovers.
    let sink = Arc::new(ScriptedSink::default());
    let mut harness = start_pipeline(sink.clone(), 100, 3);
    for lsn in [110, 120, 130, 140, 150] {
        harness.feed(lsn).await;
    }
    harness.wait_for_frontier(150).await;
    assert_eq!(sink.call_sizes().iter().sum::<usize>(), 5);
    assert_eq!(harness.tracker.frontier_lsn(), 150);

    harness.stop().await;
}
