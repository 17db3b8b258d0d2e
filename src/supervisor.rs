//! Top-level lifecycle: acquire leadership, run one pipeline cycle, unwind,
//! retry. Every cycle starts from fresh state (new tracker, new queue, new
//! connections) so a failed cycle cannot leak a broken invariant into the
//! next one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::kinesis::{create_kinesis_client, KinesisPublisher, KinesisSink, RetryConfig};
use crate::pipeline::{AckTracker, BatchConfig, InflightQueue, MicroBatcher};
use crate::postgres::{
    ensure_replication_slot, get_replication_slot_confirmed_lsn, leadership_watchdog,
    wait_for_leadership, LeaderLockKey, LeaderSession, Lsn, ReplicationReader,
};
use crate::{Error, Result};

// How long cancelled pipeline tasks get to unwind before being aborted.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct Supervisor {
    settings: Settings,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Runs leader cycles until `shutdown` fires. Always returns `Ok`: all
    /// cycle failures are logged and retried, never propagated.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let lock_key = LeaderLockKey::from_settings(
            &self.settings.postgres.slot_name,
            self.settings.postgres.leader_lock_key_override,
        );

        while !shutdown.is_cancelled() {
            match self.run_leader_cycle(&lock_key, &shutdown).await {
                Ok(()) => {}
                Err(Error::LeaderLockLost) => {
                    warn!("leader cycle ended: advisory lock lost");
                }
                Err(e) => {
                    error!(error = %e, "leader_cycle_failed");
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.pipeline.supervisor_backoff()) => {}
            }
        }

        info!("supervisor stopped");
        Ok(())
    }

    async fn run_leader_cycle(
        &self,
        lock_key: &LeaderLockKey,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let conninfo = self.settings.postgres.conninfo();
        let session = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            session = wait_for_leadership(
                &conninfo,
                lock_key,
                self.settings.pipeline.leader_acquire_interval(),
            ) => session?,
        };

        let result = self.run_pipeline(&session, shutdown).await;
        session.close().await;
        result
    }

    /// One pipeline cycle under a held leader lock: read the slot
    /// checkpoint, then run reader, publisher, and watchdog until the first
    /// of them stops.
    async fn run_pipeline(
        &self,
        session: &LeaderSession,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let slot_name = &self.settings.postgres.slot_name;
        let client = session.client();

        let created =
            ensure_replication_slot(&client, slot_name, &self.settings.postgres.output_plugin)
                .await?;
        if created {
            info!(slot = %slot_name, "created replication slot on first leader cycle");
        }
        let initial_lsn = get_replication_slot_confirmed_lsn(&client, slot_name).await?;
        info!(initial_lsn = %Lsn(initial_lsn), "leader pipeline starting");

        let queue = Arc::new(InflightQueue::new(
            self.settings.pipeline.queue_max_count,
            self.settings.pipeline.queue_max_bytes,
        ));
        let tracker = Arc::new(AckTracker::new(initial_lsn));
        let (frontier_tx, frontier_rx) = watch::channel(initial_lsn);
        let cancel = shutdown.child_token();

        let reader = ReplicationReader::new(&self.settings);
        let mut reader_task: JoinHandle<Result<()>> = tokio::spawn(reader.run(
            queue.clone(),
            tracker.clone(),
            frontier_rx,
            cancel.clone(),
        ));

        let kinesis_client = create_kinesis_client(self.settings.kinesis.region.clone()).await;
        let sink = KinesisSink::new(
            kinesis_client,
            self.settings.kinesis.stream_name.clone(),
            Duration::from_millis(self.settings.kinesis.request_timeout_ms),
        );
        let batcher = MicroBatcher::new(BatchConfig {
            max_records: self.settings.kinesis.batch_max_records,
            max_bytes: self.settings.kinesis.batch_max_bytes,
            max_linger: Duration::from_millis(self.settings.kinesis.batch_max_linger_ms),
        });
        let retry = RetryConfig {
            max_attempts: self.settings.kinesis.retry_max_attempts,
            base_delay: Duration::from_millis(self.settings.kinesis.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.settings.kinesis.retry_max_delay_ms),
            multiplier: self.settings.kinesis.retry_multiplier,
        };
        let publisher = KinesisPublisher::new(sink, batcher, retry);
        let mut publisher_task: JoinHandle<Result<()>> = tokio::spawn(publisher.run(
            queue.clone(),
            tracker.clone(),
            frontier_tx,
            cancel.clone(),
        ));

        let mut watchdog_task: JoinHandle<Result<()>> = tokio::spawn(leadership_watchdog(
            session.client(),
            self.settings.pipeline.watchdog_interval(),
            self.settings.pipeline.watchdog_probe_timeout(),
            cancel.clone(),
        ));

        #[derive(PartialEq)]
        enum Task {
            Reader,
            Publisher,
            Watchdog,
        }

        let (first_done, join_result) = tokio::select! {
            r = &mut reader_task => (Task::Reader, r),
            r = &mut publisher_task => (Task::Publisher, r),
            r = &mut watchdog_task => (Task::Watchdog, r),
        };
        cancel.cancel();

        let first_result = match join_result {
            Ok(result) => result,
            Err(e) => Err(Error::Replication {
                message: format!("pipeline task panicked: {e}"),
            }),
        };

        let mut remaining: Vec<(&str, JoinHandle<Result<()>>)> = Vec::new();
        if first_done != Task::Reader {
            remaining.push(("reader", reader_task));
        }
        if first_done != Task::Publisher {
            remaining.push(("publisher", publisher_task));
        }
        if first_done != Task::Watchdog {
            remaining.push(("watchdog", watchdog_task));
        }
        for (name, mut handle) in remaining {
            match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
                Ok(Ok(Err(e))) => debug!(task = name, error = %e, "task ended during unwind"),
                Ok(Ok(Ok(()))) | Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = name, "task did not stop within grace period; aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        first_result
    }
}
