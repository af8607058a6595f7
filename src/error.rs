//! Error types for batchq.
//!
//! These cover the crate's own plumbing (stores, configuration). Per-task
//! outcomes are reported through tickets as [`crate::model::Failure`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown store kind: {0}")]
    UnknownStore(String),

    #[error("store is not connected")]
    NotConnected,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
