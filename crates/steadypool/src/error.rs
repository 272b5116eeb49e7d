//! Error types for hardened connections and the connection pool.

use std::time::Duration;

use steadypool_driver::{DriverError, ErrorKind};
use thiserror::Error;

/// Result type alias for pool and connection operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by hardened connections, cursors and pools.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The driver cannot be pooled (unknown or zero thread safety).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Capacity exhausted and the pool is not blocking.
    #[error("too many database connections")]
    TooManyConnections,

    /// A blocking acquisition gave up at its deadline.
    #[error("no database connection became available within {0:?}")]
    AcquireTimeout(Duration),

    /// The lease has already been returned to the pool.
    #[error("connection has already been returned to the pool")]
    InvalidConnection,

    /// The cursor has been closed.
    #[error("cursor has been closed")]
    InvalidCursor,

    /// Error reported by the driver, after any recovery attempt.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl PoolError {
    /// The driver error kind, if this error came from the driver.
    pub fn driver_kind(&self) -> Option<ErrorKind> {
        match self {
            PoolError::Driver(err) => Some(err.kind()),
            _ => None,
        }
    }
}
