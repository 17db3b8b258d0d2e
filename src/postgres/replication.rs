//! The replication reader: owns the logical streaming connection, registers
//! incoming frames with the ack tracker, feeds the inflight queue, and
//! reports the publish frontier back to the slot.
//!
//! Ordering contract: frames are registered and queued in the order the
//! stream delivers them, and queue backpressure is the only throttle on the
//! read loop. No frame is dropped on this side.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{PartitionKeyMode, Settings};
use crate::pipeline::{AckTracker, ChangeEvent, InflightQueue};
use crate::{Error, Result};

use super::connection::PgSession;
use super::lsn::Lsn;

// Microseconds between the Unix epoch and the Postgres epoch (2000-01-01).
const PG_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// A CopyData payload from the streaming replication protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalFrame {
    XLogData {
        wal_start: u64,
        wal_end: u64,
        payload: Bytes,
    },
    Keepalive {
        wal_end: u64,
        reply_requested: bool,
    },
}

/// Parses the inner replication message of a CopyData frame.
pub fn parse_frame(data: &Bytes) -> Result<WalFrame> {
    if data.is_empty() {
        return Err(Error::Protocol("empty replication frame".to_string()));
    }

    let tag = data[0];
    let mut cursor = &data[1..];
    match tag {
        b'w' => {
            if cursor.remaining() < 24 {
                return Err(Error::Protocol("truncated XLogData header".to_string()));
            }
            let wal_start = cursor.get_u64();
            let wal_end = cursor.get_u64();
            let _timestamp = cursor.get_i64();
            Ok(WalFrame::XLogData {
                wal_start,
                wal_end,
                payload: data.slice(25..),
            })
        }
        b'k' => {
            if cursor.remaining() < 17 {
                return Err(Error::Protocol("truncated keepalive".to_string()));
            }
            let wal_end = cursor.get_u64();
            let _timestamp = cursor.get_i64();
            let reply_requested = cursor.get_u8() != 0;
            Ok(WalFrame::Keepalive {
                wal_end,
                reply_requested,
            })
        }
        other => Err(Error::Protocol(format!(
            "unknown replication frame tag: {}",
            other as char
        ))),
    }
}

/// Encodes a StandbyStatusUpdate carrying `lsn` as write, flush, and apply
/// positions.
pub fn encode_status_update(lsn: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(lsn);
    buf.put_u64(lsn);
    buf.put_u64(lsn);
    buf.put_i64(pg_epoch_micros());
    buf.put_u8(0);
    buf.freeze()
}

fn pg_epoch_micros() -> i64 {
    let pg_epoch = SystemTime::UNIX_EPOCH + Duration::from_secs(PG_EPOCH_UNIX_SECS);
    SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Stream start position: the highest position known to be safe. The slot
/// checkpoint seeds the frontier; anything already registered this cycle
/// must not be re-offered by a re-entered stream.
pub fn resolve_start_lsn(frontier_lsn: u64, last_registered_lsn: u64) -> u64 {
    frontier_lsn.max(last_registered_lsn)
}

fn build_start_replication_query(slot_name: &str, start: Lsn, options: &str) -> String {
    if options.trim().is_empty() {
        format!("START_REPLICATION SLOT {slot_name} LOGICAL {start}")
    } else {
        format!("START_REPLICATION SLOT {slot_name} LOGICAL {start} ({options})")
    }
}

pub struct ReplicationReader {
    conninfo: String,
    slot_name: String,
    replication_options: String,
    feedback_interval: Duration,
    partition_key_mode: PartitionKeyMode,
    partition_key_static_value: Option<String>,
}

impl ReplicationReader {
    pub fn new(settings: &Settings) -> Self {
        Self {
            conninfo: settings.postgres.replication_conninfo(),
            slot_name: settings.postgres.slot_name.clone(),
            replication_options: settings.postgres.replication_options.clone(),
            feedback_interval: settings.pipeline.feedback_interval(),
            partition_key_mode: settings.kinesis.partition_key_mode,
            partition_key_static_value: settings.kinesis.partition_key_static_value.clone(),
        }
    }

    /// Streams until cancelled or the connection fails. Every
    /// StandbyStatusUpdate sent over the lifetime of this call carries a
    /// non-decreasing LSN.
    pub async fn run(
        self,
        queue: Arc<InflightQueue>,
        tracker: Arc<AckTracker>,
        mut frontier_rx: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let session = PgSession::connect(&self.conninfo).await?;

        let start_lsn = resolve_start_lsn(tracker.frontier_lsn(), tracker.last_registered_lsn());
        let query =
            build_start_replication_query(&self.slot_name, Lsn(start_lsn), &self.replication_options);
        info!(slot = %self.slot_name, start_lsn = %Lsn(start_lsn), "starting logical replication");

        let duplex = session.client.copy_both_simple::<Bytes>(&query).await?;
        futures::pin_mut!(duplex);

        let mut feedback = tokio::time::interval(self.feedback_interval);
        feedback.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_sent = start_lsn;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("replication reader cancelled");
                    session.close().await;
                    return Ok(());
                }
                _ = feedback.tick() => {
                    let latest = *frontier_rx.borrow_and_update();
                    let lsn = next_feedback_lsn(latest, &mut last_sent);
                    trace!(lsn = %Lsn(lsn), "sending feedback");
                    duplex.send(encode_status_update(lsn)).await?;
                }
                frame = duplex.next() => {
                    let frame = frame.ok_or_else(|| Error::Replication {
                        message: "replication stream ended".to_string(),
                    })??;
                    match parse_frame(&frame)? {
                        WalFrame::XLogData { wal_start, payload, .. } => {
                            if let Some(payload) = frame_event(payload) {
                                let partition_key = self.partition_key(Lsn(wal_start), &payload);
                                let ack_id = tracker.register(wal_start);
                                let event =
                                    ChangeEvent::new(wal_start, ack_id, payload, partition_key);
                                tokio::select! {
                                    _ = cancel.cancelled() => {
                                        session.close().await;
                                        return Ok(());
                                    }
                                    _ = queue.put(event) => {}
                                }
                            }
                        }
                        WalFrame::Keepalive { reply_requested, .. } => {
                            if reply_requested {
                                let latest = *frontier_rx.borrow_and_update();
                                let lsn = next_feedback_lsn(latest, &mut last_sent);
                                duplex.send(encode_status_update(lsn)).await?;
                            }
                        }
                    }
                }
            }
        }
    }

    fn partition_key(&self, lsn: Lsn, payload: &Bytes) -> String {
        match self.partition_key_mode {
            PartitionKeyMode::Lsn => lsn.to_string(),
            PartitionKeyMode::Static => self
                .partition_key_static_value
                .clone()
                .unwrap_or_else(|| lsn.to_string()),
            PartitionKeyMode::Table => {
                extract_table_key(payload).unwrap_or_else(|| lsn.to_string())
            }
        }
    }
}

/// One XLogData frame carries one plugin document; frames with nothing to
/// publish (empty transactions) are skipped. The document structure itself
/// is plugin-specific and opaque to the relay.
fn frame_event(payload: Bytes) -> Option<Bytes> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    Some(payload)
}

fn extract_table_key(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    let table = value.get("table")?.as_str()?;
    match value.get("schema").and_then(|s| s.as_str()) {
        Some(schema) => Some(format!("{schema}.{table}")),
        None => Some(table.to_string()),
    }
}

/// Clamps the feedback LSN so the value sent to the slot never decreases.
/// A lower value draining from the frontier channel indicates a bug
/// upstream; it is logged and the last sent value is repeated.
fn next_feedback_lsn(latest: u64, last_sent: &mut u64) -> u64 {
    if latest < *last_sent {
        warn!(
            latest = %Lsn(latest),
            last_sent = %Lsn(*last_sent),
            "feedback_lsn_clamped"
        );
        *last_sent
    } else {
        *last_sent = latest;
        latest
    }
}
