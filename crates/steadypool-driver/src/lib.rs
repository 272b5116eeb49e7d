//! steadypool-driver: the driver capability consumed by steadypool.
//!
//! Defines what a database driver must provide for connections to be
//! hardened and pooled:
//! - **connector**: `Connector` / `RawConnection` / `RawCursor` traits, thread-safety levels
//! - **error**: `DriverError` tagged with an `ErrorKind`, and the `Failures` recoverability set
//! - **value**: parameter and row values
//! - **mock**: in-memory driver for tests (feature `mock`)

pub mod connector;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod value;

pub use connector::{
    discard_connection, discard_cursor, parse_threadsafety, Connector, CursorOptions, FnConnector,
    RawConnection, RawCursor, ThreadSafety,
};
pub use error::{DriverError, DriverResult, ErrorKind, Failures};
pub use value::{Row, Value};
