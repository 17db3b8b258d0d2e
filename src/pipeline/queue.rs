//! Bounded FIFO queue between the replication reader and the publisher.
//!
//! Capacity is tracked on two axes at once: message count and aggregate
//! payload bytes. A slot is held from `put` until the matching `task_done`,
//! not until `get_ready`, so the bound covers events the publisher is still
//! retrying. Backpressure on `put` is what throttles the replication read
//! loop.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use super::types::ChangeEvent;

pub struct InflightQueue {
    max_count: usize,
    max_bytes: usize,
    inner: Mutex<Inner>,
    space: Notify,
    items: Notify,
}

struct Inner {
    events: VecDeque<ChangeEvent>,
    /// Admitted events not yet returned via `task_done`.
    inflight_count: usize,
    inflight_bytes: usize,
}

impl InflightQueue {
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_count,
            max_bytes,
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                inflight_count: 0,
                inflight_bytes: 0,
            }),
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    /// Admits an event, waiting until both count and byte capacity are
    /// available. An event larger than the byte cap is admitted once the
    /// queue has fully drained, so an oversize singleton cannot deadlock
    /// the pipeline.
    pub async fn put(&self, event: ChangeEvent) {
        loop {
            let notified = self.space.notified();
            {
                let mut inner = self.inner.lock().expect("queue mutex poisoned");
                if self.admits(&inner, &event) {
                    if event.approx_size_bytes > self.max_bytes {
                        warn!(
                            ack_id = event.ack_id,
                            lsn = event.lsn,
                            size_bytes = event.approx_size_bytes,
                            max_bytes = self.max_bytes,
                            "oversize_event_admitted"
                        );
                    }
                    inner.inflight_count += 1;
                    inner.inflight_bytes += event.approx_size_bytes;
                    inner.events.push_back(event);
                    drop(inner);
                    self.items.notify_one();
                    return;
                }
            }
            notified.await;
        }
    }

    /// Returns the head event, or `None` once `timeout` elapses with the
    /// queue empty. An empty result is a normal idle condition, not an
    /// error.
    pub async fn get_ready(&self, timeout: Duration) -> Option<ChangeEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.items.notified();
            if let Some(event) = self
                .inner
                .lock()
                .expect("queue mutex poisoned")
                .events
                .pop_front()
            {
                return Some(event);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Returns the capacity held by `event`. Consuming the event by value
    /// makes a double return unrepresentable for the normal pipeline flow;
    /// the debug assertion catches gross accounting bugs in tests.
    pub fn task_done(&self, event: ChangeEvent) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        debug_assert!(inner.inflight_count > 0, "task_done without matching put");
        inner.inflight_count = inner.inflight_count.saturating_sub(1);
        inner.inflight_bytes = inner.inflight_bytes.saturating_sub(event.approx_size_bytes);
        drop(inner);
        self.space.notify_one();
    }

    /// Current (count, bytes) held against the caps.
    pub fn inflight(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        (inner.inflight_count, inner.inflight_bytes)
    }

    fn admits(&self, inner: &Inner, event: &ChangeEvent) -> bool {
        if event.approx_size_bytes > self.max_bytes {
            // Oversize singleton: wait for an empty queue rather than a byte
            // budget that can never cover it.
            return inner.inflight_count == 0;
        }
        inner.inflight_count < self.max_count
            && inner.inflight_bytes + event.approx_size_bytes <= self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn event(ack_id: u64, size: usize) -> ChangeEvent {
        ChangeEvent {
            lsn: 100 + ack_id,
            ack_id,
            payload: Bytes::from(vec![b'x'; size]),
            partition_key: String::new(),
            approx_size_bytes: size,
        }
    }

    #[tokio::test]
    async fn put_get_task_done_cycles_capacity() {
        let queue = InflightQueue::new(2, 1_000);

        queue.put(event(1, 10)).await;
        queue.put(event(2, 20)).await;
        assert_eq!(queue.inflight(), (2, 30));

        let first = queue.get_ready(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.ack_id, 1);
        // Capacity is held until task_done, not released by get_ready.
        assert_eq!(queue.inflight(), (2, 30));

        queue.task_done(first);
        assert_eq!(queue.inflight(), (1, 20));
    }

    #[tokio::test]
    async fn get_ready_returns_none_on_timeout() {
        let queue = InflightQueue::new(2, 1_000);
        assert!(queue.get_ready(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn put_blocks_on_count_cap_until_task_done() {
        let queue = std::sync::Arc::new(InflightQueue::new(1, 1_000));

        queue.put(event(1, 10)).await;

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(event(2, 10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let head = queue.get_ready(Duration::from_millis(10)).await.unwrap();
        queue.task_done(head);

        waiter.await.unwrap();
        assert_eq!(queue.inflight(), (1, 10));
    }

    #[tokio::test]
    async fn put_blocks_on_byte_cap_until_task_done() {
        let queue = std::sync::Arc::new(InflightQueue::new(10, 100));

        queue.put(event(1, 80)).await;

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(event(2, 40)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let head = queue.get_ready(Duration::from_millis(10)).await.unwrap();
        queue.task_done(head);

        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_event_admitted_once_queue_drains() {
        let queue = std::sync::Arc::new(InflightQueue::new(10, 100));

        queue.put(event(1, 50)).await;

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(event(2, 500)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let head = queue.get_ready(Duration::from_millis(10)).await.unwrap();
        queue.task_done(head);

        waiter.await.unwrap();
        let oversize = queue.get_ready(Duration::from_millis(10)).await.unwrap();
        assert_eq!(oversize.ack_id, 2);
        assert_eq!(queue.inflight(), (1, 500));
    }
}
