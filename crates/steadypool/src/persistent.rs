//! One hardened connection per thread.
//!
//! Each thread that asks for a connection gets its own, opened on first use
//! and kept for the thread's lifetime. Nothing is shared between threads, so
//! a driver with thread safety 1 is enough.
//!
//! A thread-local guard closes the connection when its thread exits.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};

use steadypool_driver::{parse_threadsafety, Connector, ThreadSafety};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::steady::{lock, HardenedConnection, SteadyOptions};

type ThreadConnections = Mutex<HashMap<ThreadId, HardenedConnection>>;

/// Removes and closes one thread's entry when that thread's locals are
/// destroyed.
struct ExitGuard {
    thread: ThreadId,
    connections: Weak<ThreadConnections>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let Some(connections) = self.connections.upgrade() else {
            return;
        };
        let removed = lock(&connections).remove(&self.thread);
        if let Some(con) = removed {
            tracing::debug!(
                connection_id = con.id(),
                thread = ?self.thread,
                "closed persistent connection of exited thread"
            );
            con.discard();
        }
    }
}

thread_local! {
    static EXIT_GUARDS: RefCell<Vec<ExitGuard>> = const { RefCell::new(Vec::new()) };
}

/// Arrange for the calling thread's entry in `connections` to be closed when
/// the thread exits. One guard per pool and thread.
fn register_exit_guard(thread: ThreadId, connections: &Arc<ThreadConnections>) {
    // Fails only while this thread's locals are being torn down.
    let _ = EXIT_GUARDS.try_with(|guards| {
        let mut guards = guards.borrow_mut();
        guards.retain(|guard| guard.connections.strong_count() > 0);
        let target = Arc::downgrade(connections);
        if !guards.iter().any(|guard| guard.connections.ptr_eq(&target)) {
            guards.push(ExitGuard {
                thread,
                connections: target,
            });
        }
    });
}

/// Thread-affine connection provider.
pub struct PersistentPool {
    connector: Arc<dyn Connector>,
    steady: SteadyOptions,
    connections: Arc<ThreadConnections>,
}

impl PersistentPool {
    /// Connections use the hardening settings of `config`; the pool size
    /// limits do not apply. They are not closeable by default.
    pub fn new(connector: Arc<dyn Connector>, config: &PoolConfig) -> PoolResult<Self> {
        let threadsafety = parse_threadsafety(connector.threadsafety())
            .map_err(|err| PoolError::Configuration(err.message().to_string()))?;
        if threadsafety == ThreadSafety::Unsafe {
            return Err(PoolError::Configuration(format!(
                "driver {} is not thread-safe",
                connector.name()
            )));
        }
        Ok(Self {
            connector,
            steady: SteadyOptions::from(config).with_closeable(false),
            connections: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Builder method: let `close()` on a thread's connection really close it.
    pub fn with_closeable(mut self, closeable: bool) -> Self {
        self.steady.closeable = closeable;
        self
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<ThreadId, HardenedConnection>> {
        lock(&self.connections)
    }

    /// The calling thread's connection, opened on first use.
    pub fn connection(&self) -> PoolResult<HardenedConnection> {
        let thread = thread::current().id();
        if let Some(con) = self.lock_connections().get(&thread) {
            return Ok(con.clone());
        }
        let con = self.steady_connection()?;
        tracing::debug!(
            connection_id = con.id(),
            thread = ?thread,
            "opened persistent connection"
        );
        self.lock_connections().insert(thread, con.clone());
        register_exit_guard(thread, &self.connections);
        Ok(con)
    }

    /// An unpooled hardened connection with this pool's settings.
    pub fn steady_connection(&self) -> PoolResult<HardenedConnection> {
        HardenedConnection::connect(Arc::clone(&self.connector), self.steady.clone())
    }

    /// Close and forget the calling thread's connection.
    pub fn close_thread_connection(&self) {
        let removed = self.lock_connections().remove(&thread::current().id());
        if let Some(con) = removed {
            con.discard();
        }
    }

    /// Close every thread's connection.
    pub fn close(&self) {
        let connections = std::mem::take(&mut *self.lock_connections());
        let closed = connections.len();
        for con in connections.into_values() {
            con.discard();
        }
        if closed > 0 {
            tracing::info!(closed = closed, "persistent connections closed");
        }
    }

    /// Number of live threads currently holding a connection.
    pub fn len(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PersistentPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PersistentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentPool")
            .field("driver", &self.connector.name())
            .field("threads", &self.len())
            .finish_non_exhaustive()
    }
}
