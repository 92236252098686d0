//! Proxy error types.

use thiserror::Error;

/// Errors raised by the proxy codec, server and client.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Transport I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded the configured size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Frame body size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame body was not a valid message.
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// The remote side reported a failure.
    ///
    /// Local error kinds are not carried across the wire; only the message is.
    #[error("remote failure: {0}")]
    Remote(String),

    /// A statement that was required to produce rows produced none.
    #[error("{0}")]
    NoRows(String),

    /// The remote transaction or command block is already finished.
    #[error("transaction already finished")]
    AlreadyFinished,

    /// The transport closed before a response arrived.
    #[error("proxy connection closed")]
    Closed,

    /// A request named a transaction the server does not hold.
    #[error("unknown transaction {0}")]
    UnknownTransaction(u64),

    /// A request named a command block the server does not hold.
    #[error("unknown command block {block} in transaction {txn}")]
    UnknownBlock {
        /// Transaction identifier.
        txn: u64,
        /// Block identifier.
        block: u64,
    },
}

impl ProxyError {
    /// Check if this error ends the connection it occurred on.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::FrameTooLarge { .. } | Self::Decode(_) | Self::Closed
        )
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
