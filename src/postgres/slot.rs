//! Replication slot bootstrap and checkpoint lookup.
//!
//! The slot's `confirmed_flush_lsn` is the only durable cursor this service
//! has; everything restarts from what these queries report.

use tokio_postgres::Client;
use tracing::{debug, info};

use crate::{Error, Result};

use super::lsn::Lsn;

/// Creates the logical replication slot when missing. Returns `true` when
/// the slot was created by this call, `false` when it already existed.
pub async fn ensure_replication_slot(
    client: &Client,
    slot_name: &str,
    output_plugin: &str,
) -> Result<bool> {
    let existing = client
        .query_opt(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;
    if existing.is_some() {
        debug!(slot = slot_name, "replication slot already exists");
        return Ok(false);
    }

    let row = client
        .query_one(
            "SELECT slot_name, lsn::text FROM pg_create_logical_replication_slot($1, $2)",
            &[&slot_name, &output_plugin],
        )
        .await?;
    let consistent_point: &str = row.get(1);
    info!(
        slot = slot_name,
        plugin = output_plugin,
        consistent_point,
        "replication slot created"
    );
    Ok(true)
}

/// Returns the slot checkpoint used for replication startup.
///
/// Preference order: `confirmed_flush_lsn`, then `restart_lsn`, then 0 when
/// neither has been initialized. A missing slot is an error, never a silent
/// restart from 0.
pub async fn get_replication_slot_confirmed_lsn(client: &Client, slot_name: &str) -> Result<u64> {
    let row = client
        .query_opt(
            "SELECT confirmed_flush_lsn::text, restart_lsn::text \
             FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?
        .ok_or_else(|| Error::Replication {
            message: format!("Replication slot not found: {slot_name}"),
        })?;

    let confirmed_flush_lsn: Option<String> = row.get(0);
    let restart_lsn: Option<String> = row.get(1);

    resolve_slot_start_lsn(confirmed_flush_lsn.as_deref(), restart_lsn.as_deref())
}

fn resolve_slot_start_lsn(
    confirmed_flush_lsn: Option<&str>,
    restart_lsn: Option<&str>,
) -> Result<u64> {
    if let Some(text) = confirmed_flush_lsn {
        return Ok(text.parse::<Lsn>()?.value());
    }
    if let Some(text) = restart_lsn {
        return Ok(text.parse::<Lsn>()?.value());
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_confirmed_flush_lsn() {
        let resolved = resolve_slot_start_lsn(Some("16/B374D848"), Some("16/B0000000")).unwrap();
        assert_eq!(resolved, "16/B374D848".parse::<Lsn>().unwrap().value());
    }

    #[test]
    fn falls_back_to_restart_lsn() {
        let resolved = resolve_slot_start_lsn(None, Some("0/16B6D80")).unwrap();
        assert_eq!(resolved, "0/16B6D80".parse::<Lsn>().unwrap().value());
    }

    #[test]
    fn uninitialized_slot_resolves_to_zero() {
        assert_eq!(resolve_slot_start_lsn(None, None).unwrap(), 0);
    }

    #[test]
    fn malformed_lsn_text_is_an_error() {
        assert!(resolve_slot_start_lsn(Some("bogus"), None).is_err());
    }
}
