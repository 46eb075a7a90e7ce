//! Error taxonomy for store, pipeline and replication operations.
//!
//! File and snapshot plumbing (opening the data directory, persisting) uses `anyhow` with context;
//! everything a caller may want to match on is a variant here.

use thiserror::Error;

use crate::types::Version;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A write or delete carried a version older than the stored one.
    #[error("version conflict on key {key:?}: stored {stored}, attempted {attempted}")]
    Conflict {
        key: String,
        stored: Version,
        attempted: Version,
    },

    #[error("key not found: {0:?}")]
    NotFound(String),

    /// Intake or outbound queue saturated.
    #[error("queue is full")]
    QueueFull,

    #[error("remote call timed out")]
    Timeout,

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// A peer took fewer records than it was sent.
    #[error("peer accepted {accepted} of {sent} records")]
    PartialPush { accepted: usize, sent: usize },

    /// Unparseable record, pattern or response.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// The component has been shut down and no longer accepts work.
    #[error("component is shut down")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),
}
