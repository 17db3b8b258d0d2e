//! Everything that talks to Postgres: session plumbing, LSN handling, slot
//! bootstrap, the logical replication reader, and advisory-lock leadership.

pub mod connection;
pub mod leadership;
pub mod lsn;
pub mod replication;
pub mod slot;

pub use connection::PgSession;
pub use leadership::{leadership_watchdog, wait_for_leadership, LeaderLockKey, LeaderSession};
pub use lsn::Lsn;
pub use replication::ReplicationReader;
pub use slot::{ensure_replication_slot, get_replication_slot_confirmed_lsn};
