//! The driver capability consumed by the hardening and pooling layers.
//!
//! A driver is split into three traits:
//!
//! ```text
//! Connector       creates raw connections, reports thread safety
//!   RawConnection  cursor / commit / rollback / ping / begin / cancel / close
//!     RawCursor    execute / executemany / callproc / fetch* / size hints / close
//! ```
//!
//! Every error crossing this boundary is a [`DriverError`] tagged with an
//! [`ErrorKind`](crate::ErrorKind), which is all the upper layers need to
//! decide whether a failure is recoverable.

use std::fmt;

use crate::error::{DriverError, DriverResult, Failures};
use crate::value::{Row, Value};

/// How far a driver's objects may be shared across threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreadSafety {
    /// Level 0: not even the module may be shared between threads.
    Unsafe,
    /// Level 1: threads may use the driver, but each connection must only be
    /// used by one thread at a time.
    Serialized,
    /// Level 2: a single connection object may be shared across threads.
    SharedConnections,
    /// Level 3: connections and cursors may be shared, also across processes.
    Full,
}

impl ThreadSafety {
    pub fn level(self) -> u8 {
        match self {
            ThreadSafety::Unsafe => 0,
            ThreadSafety::Serialized => 1,
            ThreadSafety::SharedConnections => 2,
            ThreadSafety::Full => 3,
        }
    }

    /// Whether connections of this driver may be handed to several callers at once.
    pub fn allows_sharing(self) -> bool {
        self >= ThreadSafety::SharedConnections
    }
}

impl TryFrom<u8> for ThreadSafety {
    type Error = u8;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(ThreadSafety::Unsafe),
            1 => Ok(ThreadSafety::Serialized),
            2 => Ok(ThreadSafety::SharedConnections),
            3 => Ok(ThreadSafety::Full),
            other => Err(other),
        }
    }
}

impl fmt::Display for ThreadSafety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Arguments passed through to the driver's cursor constructor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CursorOptions {
    /// Name for a server-side (named) cursor.
    pub name: Option<String>,
}

impl CursorOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// Factory for raw connections, the "creator" of a pool.
pub trait Connector: Send + Sync {
    /// Open a new raw connection.
    fn connect(&self) -> DriverResult<Box<dyn RawConnection>>;

    /// Driver-reported thread-safety level, `None` if it cannot be determined.
    fn threadsafety(&self) -> Option<u8>;

    /// Error kinds this driver considers transient. `None` selects the
    /// default (operational and internal errors).
    fn failures(&self) -> Option<Failures> {
        None
    }

    /// Short driver name used in log output.
    fn name(&self) -> &str {
        "driver"
    }
}

/// One live connection to the database, as produced by a [`Connector`].
pub trait RawConnection: Send + fmt::Debug {
    /// Open a cursor on this connection.
    fn cursor(&mut self, options: &CursorOptions) -> DriverResult<Box<dyn RawCursor>>;

    fn commit(&mut self) -> DriverResult<()>;

    fn rollback(&mut self) -> DriverResult<()>;

    /// Check that the server is still reachable.
    ///
    /// Drivers without a liveness probe should return a
    /// [`NotSupported`](crate::ErrorKind::NotSupported) error; the hardening
    /// layer treats any error here as a dead connection.
    fn ping(&mut self) -> DriverResult<()>;

    /// Transaction-begin extension (e.g. distributed transactions).
    fn begin(&mut self, _args: &[Value]) -> DriverResult<()> {
        Ok(())
    }

    /// Cancel a long-running operation or transaction.
    fn cancel(&mut self) -> DriverResult<()> {
        Ok(())
    }

    /// Close the underlying transport.
    fn close(&mut self) -> DriverResult<()>;
}

/// A cursor on a [`RawConnection`].
pub trait RawCursor: Send + fmt::Debug {
    fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<()>;

    fn executemany(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> DriverResult<()>;

    /// Call a stored procedure, returning the (possibly modified) parameters.
    fn callproc(&mut self, name: &str, params: &[Value]) -> DriverResult<Vec<Value>>;

    fn fetchone(&mut self) -> DriverResult<Option<Row>>;

    fn fetchmany(&mut self, size: usize) -> DriverResult<Vec<Row>> {
        let mut rows = Vec::with_capacity(size);
        while rows.len() < size {
            match self.fetchone()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    fn fetchall(&mut self) -> DriverResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetchone()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Predefine memory areas for the parameters of the next execute.
    fn setinputsizes(&mut self, _sizes: &[usize]) -> DriverResult<()> {
        Ok(())
    }

    /// Set a column buffer size for large columns (`None` = all columns).
    fn setoutputsize(&mut self, _size: usize, _column: Option<usize>) -> DriverResult<()> {
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()>;
}

type ConnectFn = dyn Fn() -> DriverResult<Box<dyn RawConnection>> + Send + Sync;

/// A [`Connector`] built from a plain function, for failover or load-balancing
/// creators that are not tied to one driver module.
pub struct FnConnector {
    name: String,
    threadsafety: Option<u8>,
    failures: Option<Failures>,
    connect: Box<ConnectFn>,
}

impl FnConnector {
    pub fn new<F>(threadsafety: Option<u8>, connect: F) -> Self
    where
        F: Fn() -> DriverResult<Box<dyn RawConnection>> + Send + Sync + 'static,
    {
        Self {
            name: "fn".to_string(),
            threadsafety,
            failures: None,
            connect: Box::new(connect),
        }
    }

    /// Builder method: set the name used in logs.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Builder method: set the driver's transient error kinds.
    pub fn with_failures(self, failures: Failures) -> Self {
        Self {
            failures: Some(failures),
            ..self
        }
    }
}

impl Connector for FnConnector {
    fn connect(&self) -> DriverResult<Box<dyn RawConnection>> {
        (self.connect)()
    }

    fn threadsafety(&self) -> Option<u8> {
        self.threadsafety
    }

    fn failures(&self) -> Option<Failures> {
        self.failures.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for FnConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConnector")
            .field("name", &self.name)
            .field("threadsafety", &self.threadsafety)
            .finish_non_exhaustive()
    }
}

/// Close a raw connection whose fate no longer matters, logging instead of failing.
pub fn discard_connection(mut con: Box<dyn RawConnection>) {
    if let Err(err) = con.close() {
        tracing::debug!(error = %err, "ignored error while closing discarded connection");
    }
}

/// Close a raw cursor whose fate no longer matters, logging instead of failing.
pub fn discard_cursor(mut cursor: Box<dyn RawCursor>) {
    if let Err(err) = cursor.close() {
        tracing::debug!(error = %err, "ignored error while closing discarded cursor");
    }
}

impl From<ThreadSafety> for u8 {
    fn from(level: ThreadSafety) -> Self {
        level.level()
    }
}

/// Map a driver-reported level to [`ThreadSafety`], rejecting unknown levels.
pub fn parse_threadsafety(level: Option<u8>) -> Result<ThreadSafety, DriverError> {
    let level = level.ok_or_else(|| {
        DriverError::not_supported("driver does not report a thread-safety level")
    })?;
    ThreadSafety::try_from(level)
        .map_err(|l| DriverError::not_supported(format!("unknown thread-safety level {l}")))
}
