use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, error};

use crate::Result;

/// An open session plus the spawned task driving its socket. The driver
/// finishes on its own once the client is dropped.
pub struct PgSession {
    pub client: Client,
    driver: tokio::task::JoinHandle<()>,
}

impl PgSession {
    /// Connects and spawns the connection driver. Used for regular sessions
    /// (slot queries, advisory locks) and, with `replication=database` in
    /// the conninfo, for the streaming session.
    pub async fn connect(conninfo: &str) -> Result<Self> {
        let config = conninfo.parse::<Config>()?;
        let (client, connection) = config.connect(NoTls).await?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection terminated");
            }
        });
        debug!("postgres session established");

        Ok(Self { client, driver })
    }

    /// Closes the session. Dropping the client ends the driver; the abort
    /// is a backstop for a driver blocked on a dead peer.
    pub async fn close(self) {
        drop(self.client);
        self.driver.abort();
        let _ = self.driver.await;
    }

    /// Splits the session for callers that need to share the client across
    /// tasks. The driver handle must still be awaited or aborted on close.
    pub fn into_parts(self) -> (Client, tokio::task::JoinHandle<()>) {
        (self.client, self.driver)
    }
}
