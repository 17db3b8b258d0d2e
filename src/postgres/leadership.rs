//! Leader election over a Postgres advisory lock.
//!
//! The lock key is derived from the replication slot name inside Postgres
//! (md5 split into two int4 halves) so every replica computes the same key
//! regardless of build, or taken verbatim from the configured override.
//! Holding the lock is co-terminus with the session that acquired it:
//! release happens by closing the session, never by an explicit unlock.

use std::sync::Arc;
use std::time::Duration;

use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

use super::connection::PgSession;

/// How the advisory lock key is obtained.
#[derive(Debug, Clone)]
pub enum LeaderLockKey {
    /// Derive from a name (the replication slot name) via md5 in Postgres.
    DerivedFrom(String),
    /// Use an explicit 64-bit key.
    Explicit(i64),
}

impl LeaderLockKey {
    pub fn from_settings(slot_name: &str, override_key: Option<i64>) -> Self {
        match override_key {
            Some(key) => LeaderLockKey::Explicit(key),
            None => LeaderLockKey::DerivedFrom(slot_name.to_string()),
        }
    }

    async fn try_acquire(&self, client: &Client) -> Result<bool> {
        let row = match self {
            LeaderLockKey::DerivedFrom(name) => {
                client
                    .query_one(
                        "SELECT pg_try_advisory_lock( \
                             ('x' || substr(md5($1), 1, 8))::bit(32)::int, \
                             ('x' || substr(md5($1), 9, 8))::bit(32)::int \
                         )",
                        &[name],
                    )
                    .await?
            }
            LeaderLockKey::Explicit(key) => {
                client
                    .query_one("SELECT pg_try_advisory_lock($1)", &[key])
                    .await?
            }
        };
        Ok(row.get::<_, bool>(0))
    }
}

/// A session holding the leader advisory lock. Closing it releases the
/// lock on the server.
pub struct LeaderSession {
    client: Arc<Client>,
    driver: tokio::task::JoinHandle<()>,
}

impl LeaderSession {
    /// Shared handle for the watchdog's probe queries. The lock belongs to
    /// this session, so the probe must run on this client and no other.
    pub fn client(&self) -> Arc<Client> {
        self.client.clone()
    }

    pub async fn close(self) {
        drop(self.client);
        self.driver.abort();
        let _ = self.driver.await;
        info!("leader session closed");
    }
}

/// Opens a dedicated session and polls the non-blocking advisory-lock
/// acquire until it succeeds. There is no total timeout; a standby waits
/// indefinitely for the current leader to let go.
pub async fn wait_for_leadership(
    conninfo: &str,
    lock_key: &LeaderLockKey,
    retry_interval: Duration,
) -> Result<LeaderSession> {
    let (client, driver) = PgSession::connect(conninfo).await?.into_parts();

    loop {
        if lock_key.try_acquire(&client).await? {
            info!("leadership acquired");
            return Ok(LeaderSession {
                client: Arc::new(client),
                driver,
            });
        }
        debug!(
            retry_in_ms = retry_interval.as_millis() as u64,
            "advisory lock held elsewhere"
        );
        tokio::time::sleep(retry_interval).await;
    }
}

/// Polls `pg_locks` on the leader session to confirm the advisory lock is
/// still granted. Returns [`Error::LeaderLockLost`] on loss so the
/// supervisor can log the unwind distinctly from ordinary failures.
pub async fn leadership_watchdog(
    client: Arc<Client>,
    interval: Duration,
    probe_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; consume it so a freshly elected
    // leader is not probed before the pipeline even starts.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let probe = client.query_one(
            "SELECT count(*)::int4 FROM pg_locks \
             WHERE locktype = 'advisory' AND pid = pg_backend_pid() AND granted",
            &[],
        );
        let held = match tokio::time::timeout(probe_timeout, probe).await {
            Ok(Ok(row)) => row.get::<_, i32>(0) > 0,
            Ok(Err(e)) => return Err(Error::Postgres(e)),
            Err(_) => {
                return Err(Error::Timeout {
                    message: format!("watchdog probe exceeded {probe_timeout:?}"),
                })
            }
        };

        if !held {
            warn!("leadership_lost");
            return Err(Error::LeaderLockLost);
        }
    }
}
