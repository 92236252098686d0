//! Pool error types.

use thiserror::Error;

use crate::driver::DriverError;

/// Boxed error returned by commit/abort hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during pool and transaction operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The transaction has no hope of reaching a connection.
    ///
    /// Raised when the pool is stopped or stopping, when a spooled
    /// transaction is aborted before it was ever connected, or when a
    /// replacement connection could not be opened.
    #[error("connection unavailable: {0}")]
    Connection(String),

    /// The transaction or command block is already committed, aborted, or ended.
    #[error("transaction already finished")]
    AlreadyFinished,

    /// The driver rejected a statement, commit, or rollback.
    #[error("driver error: {0}")]
    Driver(#[source] DriverError),

    /// A statement that was required to produce rows produced none.
    ///
    /// Carries the message supplied with the statement.
    #[error("{0}")]
    NoRows(String),

    /// A pre-commit hook failed; the transaction was aborted instead.
    #[error("pre-commit hook failed: {0}")]
    Hook(#[source] BoxError),

    /// Work was submitted to a worker slot that is not running.
    #[error("worker slot {slot} is not running")]
    SlotNotRunning {
        /// Name of the slot.
        slot: String,
    },

    /// The worker slot exited before completing the operation.
    #[error("worker slot exited before the operation completed")]
    SlotGone,

    /// The worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Check if this is a connection-unavailable error.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Check if this error reports an operation on a finished transaction or block.
    #[must_use]
    pub fn is_already_finished(&self) -> bool {
        matches!(self, Self::AlreadyFinished)
    }

    /// Check if this error came from the underlying driver.
    #[must_use]
    pub fn is_driver_error(&self) -> bool {
        matches!(self, Self::Driver(_))
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        assert!(PoolError::Connection("stopped".into()).is_connection_error());
        assert!(PoolError::AlreadyFinished.is_already_finished());
        assert!(!PoolError::AlreadyFinished.is_connection_error());

        let driver = PoolError::Driver("syntax error".into());
        assert!(driver.is_driver_error());
        assert_eq!(driver.to_string(), "driver error: syntax error");
    }

    #[test]
    fn test_no_rows_displays_caller_message() {
        let err = PoolError::NoRows("no such calendar".into());
        assert_eq!(err.to_string(), "no such calendar");
    }
}
