use thiserror::Error;

/// Errors surfaced by the shardcomm crates.
///
/// The dispatcher itself reports operation outcomes through
/// [`crate::protocol::CommResult`] records rather than `Err` values; this
/// type covers everything around that boundary: malformed inputs, the
/// transport plumbing, and shutdown.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("did not understand destination '{0}'")]
    InvalidDestination(String),

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("{0}")]
    Header(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, CommError>;
