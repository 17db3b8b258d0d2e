use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Replication error: {message}")]
    Replication { message: String },

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Leader advisory lock lost")]
    LeaderLockLost,
}

pub type Result<T> = std::result::Result<T, Error>;
