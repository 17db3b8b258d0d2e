//! # pg-kinesis-relay
//!
//! A change-data-capture relay that streams PostgreSQL logical replication
//! into an Amazon Kinesis stream and reports a durable checkpoint back to
//! the replication slot.
//!
//! ## Overview
//!
//! The relay connects to Postgres as a logical replication client, turns
//! WAL frames into partition-keyed records, micro-batches them into
//! `PutRecords` calls, and advances the slot's `confirmed_flush_lsn` only
//! once everything at or below that position has been published. Exactly
//! one replica is active at a time; leadership is coordinated through a
//! Postgres advisory lock, so spare replicas can run hot and take over on
//! failure.
//!
//! Delivery is at-least-once: a failover replays everything past the last
//! confirmed slot position, and records that exhaust their retries are
//! dropped (and logged) rather than allowed to stall the slot.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pg_kinesis_relay::{Result, Settings, Supervisor};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = Settings::from_env()?;
//!     let shutdown = CancellationToken::new();
//!     Supervisor::new(settings).run(shutdown).await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`supervisor`] - leader-cycle lifecycle
//! - [`postgres`] - replication stream, slot queries, advisory-lock
//!   leadership
//! - [`pipeline`] - inflight queue, ack frontier, micro-batcher
//! - [`kinesis`] - sink client, error classification, publisher
//! - [`config`] - environment-driven settings
//! - [`error`] - error types and handling

/// Environment-driven settings and validation
pub mod config;

/// Error types and result handling
pub mod error;

/// Kinesis sink, error classification, and the publishing task
pub mod kinesis;

/// Inflight queue, ack frontier, and micro-batching
pub mod pipeline;

/// Replication stream, slot bootstrap, and leadership
pub mod postgres;

/// Leader-cycle supervisor
pub mod supervisor;

pub use config::Settings;
pub use error::{Error, Result};
pub use supervisor::Supervisor;
