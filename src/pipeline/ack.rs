//! Contiguous-frontier acknowledgement tracking.
//!
//! Registrations are kept in registration (ack_id) order, not LSN order:
//! WAL replay at startup can reoffer positions below ones already seen, so
//! LSN is only weakly monotonic. The frontier sweeps the registration queue
//! head-first and reports `max(previous_frontier, swept.lsn)`, which means a
//! late low-LSN registration can never pull the reported frontier backwards.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::warn;

use crate::postgres::Lsn;

pub struct AckTracker {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Unretired registrations in ack_id order; the entry for ack_id `a`
    /// lives at index `a - head_ack_id`.
    pending: VecDeque<Pending>,
    head_ack_id: u64,
    next_ack_id: u64,
    last_registered_lsn: u64,
    frontier_lsn: u64,
}

struct Pending {
    lsn: u64,
    published: bool,
}

impl AckTracker {
    /// Frontier starts at the slot checkpoint read at leader start.
    pub fn new(initial_lsn: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                head_ack_id: 1,
                next_ack_id: 1,
                last_registered_lsn: 0,
                frontier_lsn: initial_lsn,
            }),
        }
    }

    /// Records a registration and returns its ack_id. A strictly lower LSN
    /// than the previous registration is tolerated but logged.
    pub fn register(&self, lsn: u64) -> u64 {
        let mut inner = self.inner.lock().expect("ack tracker mutex poisoned");
        if lsn < inner.last_registered_lsn {
            warn!(
                lsn = %Lsn(lsn),
                last_registered_lsn = %Lsn(inner.last_registered_lsn),
                "ack_register_lsn_regression"
            );
        } else {
            inner.last_registered_lsn = lsn;
        }

        let ack_id = inner.next_ack_id;
        inner.next_ack_id += 1;
        inner.pending.push_back(Pending {
            lsn,
            published: false,
        });
        ack_id
    }

    /// Marks a registration published. Idempotent; an unknown ack_id (never
    /// issued, or already retired by a frontier advance) is a warned no-op.
    pub fn mark_published_by_id(&self, ack_id: u64) {
        let mut inner = self.inner.lock().expect("ack tracker mutex poisoned");
        if ack_id < inner.head_ack_id {
            // Already retired; a repeat mark after a frontier sweep.
            return;
        }
        let index = (ack_id - inner.head_ack_id) as usize;
        match inner.pending.get_mut(index) {
            Some(entry) => entry.published = true,
            None => {
                warn!(ack_id, "ack_mark_unknown_id");
                return;
            }
        }

        // Retire the contiguous published prefix.
        while inner.pending.front().is_some_and(|p| p.published) {
            if let Some(retired) = inner.pending.pop_front() {
                inner.head_ack_id += 1;
                inner.frontier_lsn = inner.frontier_lsn.max(retired.lsn);
            }
        }
    }

    /// Highest LSN for which every earlier registration is published.
    pub fn frontier_lsn(&self) -> u64 {
        self.inner
            .lock()
            .expect("ack tracker mutex poisoned")
            .frontier_lsn
    }

    pub fn last_registered_lsn(&self) -> u64 {
        self.inner
            .lock()
            .expect("ack tracker mutex poisoned")
            .last_registered_lsn
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .expect("ack tracker mutex poisoned")
            .pending
            .len()
    }
}
