use bytes::Bytes;

/// A single decoded change, owned exclusively by one pipeline stage at a
/// time: reader -> queue -> publisher. After the publisher signals
/// `task_done` the event no longer exists anywhere in the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// WAL position of the frame that produced this event.
    pub lsn: u64,
    /// Process-local registration handle; see [`AckTracker`](super::AckTracker).
    pub ack_id: u64,
    /// Opaque plugin output. The relay never inspects it beyond partition
    /// key extraction.
    pub payload: Bytes,
    pub partition_key: String,
    /// Payload size used for queue and batch byte accounting.
    pub approx_size_bytes: usize,
}

impl ChangeEvent {
    pub fn new(lsn: u64, ack_id: u64, payload: Bytes, partition_key: String) -> Self {
        let approx_size_bytes = payload.len() + partition_key.len();
        Self {
            lsn,
            ack_id,
            payload,
            partition_key,
            approx_size_bytes,
        }
    }
}
