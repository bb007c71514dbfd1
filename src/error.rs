use std::io;
use thiserror::Error;

/// type alias for all operations in this crate that could fail with a [`ShardError`]
pub type Result<T> = std::result::Result<T, ShardError>;

/// Error variants used throughout the table substrate.
/// It wraps any lower level errors from third party crates
#[derive(Error)]
pub enum ShardError {
    /// variant for errors caused by std::io
    #[error("IO error")]
    Io {
        /// source of the IO Error
        #[from]
        source: io::Error,
    },

    /// variant for errors caused during control-message serialization/deserialization
    #[error("serialization/deserialization error")]
    Serialization(#[from] serde_json::Error),

    /// the fabric could not deliver a message and the process cannot continue
    #[error("transport failure: {}", .0)]
    TransportFatal(String),

    /// soft failure: the shard exists but its owner has not marked it serving yet.
    /// Requests hitting this variant are re-enqueued by the dispatcher
    #[error("shard {} of table {} is not serving", .shard, .table)]
    ShardNotReady {
        /// id of the table being addressed
        table: u32,
        /// index of the shard that is not serving
        shard: u32,
    },

    /// variant for a get against a key with no stored value; surfaced to the
    /// caller as a miss, never retried
    #[error("key not found")]
    KeyAbsent,

    /// a key or value could not be converted through its marshaller
    #[error("marshal error: {}", .0)]
    Marshal(String),

    /// an unknown tag or a malformed frame arrived off the wire
    #[error("protocol violation: {}", .0)]
    Protocol(String),

    /// variant for invalid configuration values or files
    #[error("configuration error: {}", .0)]
    Config(String),

    /// the runtime is shutting down and the blocked operation cannot complete
    #[error("shutting down")]
    Shutdown,
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for ShardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}

impl ShardError {
    /// true for the error classes the dispatcher treats as soft: the request
    /// is put back at the tail of its queue instead of being dropped
    pub fn is_soft(&self) -> bool {
        matches!(self, ShardError::ShardNotReady { .. })
    }
}
