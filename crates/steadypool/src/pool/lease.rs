//! Lease handles returned by [`ConnectionPool`](super::ConnectionPool).

use std::fmt;
use std::sync::Arc;

use steadypool_driver::{CursorOptions, Value};

use super::PoolInner;
use crate::error::{PoolError, PoolResult};
use crate::steady::{Connection, HardenedConnection, HardenedCursor};

enum Lease {
    Dedicated(HardenedConnection),
    Shared(HardenedConnection),
}

impl Lease {
    fn connection(&self) -> &HardenedConnection {
        match self {
            Lease::Dedicated(con) | Lease::Shared(con) => con,
        }
    }
}

/// A connection leased from the pool.
///
/// Closing (or dropping) the handle gives the connection back; a shared
/// connection goes back once its last lease is closed.
///
/// Cursors opened through the lease hold the underlying connection, not the
/// lease. They keep working after the lease is returned, on a connection
/// the pool may already have handed to someone else, so close them first.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    lease: Option<Lease>,
    epoch: u64,
}

impl PooledConnection {
    pub(crate) fn dedicated(pool: Arc<PoolInner>, con: HardenedConnection, epoch: u64) -> Self {
        Self {
            pool,
            lease: Some(Lease::Dedicated(con)),
            epoch,
        }
    }

    pub(crate) fn shared(pool: Arc<PoolInner>, con: HardenedConnection, epoch: u64) -> Self {
        Self {
            pool,
            lease: Some(Lease::Shared(con)),
            epoch,
        }
    }

    /// The leased connection.
    pub fn hardened(&self) -> PoolResult<&HardenedConnection> {
        self.lease
            .as_ref()
            .map(Lease::connection)
            .ok_or(PoolError::InvalidConnection)
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.lease, Some(Lease::Shared(_)))
    }

    pub fn is_closed(&self) -> bool {
        self.lease.is_none()
    }

    fn give_back(&mut self) {
        match self.lease.take() {
            Some(Lease::Dedicated(con)) => self.pool.release(con, false, self.epoch),
            Some(Lease::Shared(con)) => self.pool.release(con, true, self.epoch),
            None => {}
        }
    }

    fn notify_if_shared(&self) {
        if self.is_shared() {
            self.pool.notify();
        }
    }
}

impl Connection for PooledConnection {
    fn cursor_with(&self, options: CursorOptions) -> PoolResult<HardenedCursor> {
        self.hardened()?.cursor_with(options)
    }

    fn commit(&self) -> PoolResult<()> {
        let result = self.hardened()?.commit();
        self.notify_if_shared();
        result
    }

    fn rollback(&self) -> PoolResult<()> {
        let result = self.hardened()?.rollback();
        self.notify_if_shared();
        result
    }

    fn begin(&self, args: &[Value]) -> PoolResult<()> {
        self.hardened()?.begin(args)
    }

    fn cancel(&self) -> PoolResult<()> {
        let result = self.hardened()?.cancel();
        self.notify_if_shared();
        result
    }

    fn ping(&self) -> PoolResult<()> {
        self.hardened()?.ping()
    }

    /// Give the connection back to the pool. Closing twice is a no-op.
    fn close(&mut self) -> PoolResult<()> {
        self.give_back();
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.lease.as_ref().map(Lease::connection))
            .field("shared", &self.is_shared())
            .finish_non_exhaustive()
    }
}
