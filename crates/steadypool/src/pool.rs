//! Thread-safe pool of hardened connections.
//!
//! All bookkeeping lives in one `Mutex<PoolState>` paired with a `Condvar`:
//!
//! ```text
//! idle     VecDeque<HardenedConnection>   ready dedicated connections (FIFO)
//! shared   Vec<SharedSlot>                connections leased to several callers
//! outstanding                             distinct connections currently leased
//! ```
//!
//! Dedicated connections go idle → leased → idle. Shareable requests fill the
//! shared cache up to `max_shared`, then attach to the least-shared slot that
//! is not inside a transaction. Every release and close wakes all waiters.
//!
//! Lock order is pool state, then connection state.

mod lease;

pub use lease::PooledConnection;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use steadypool_driver::{parse_threadsafety, Connector, ThreadSafety};

use crate::config::{PingContext, PoolConfig, ResetPolicy};
use crate::error::{PoolError, PoolResult};
use crate::steady::{lock, HardenedConnection, SteadyOptions};

/// Snapshot of pool occupancy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections waiting in the idle cache.
    pub idle: usize,
    /// Connections in the shared cache.
    pub shared: usize,
    /// Shared leases across all shared connections.
    pub shares: usize,
    /// Distinct connections currently leased.
    pub outstanding: usize,
    /// Number of times an acquisition had to wait.
    pub wait_count: u64,
}

/// A bounded pool of [`HardenedConnection`]s.
///
/// Cloning yields another handle to the same pool. The pool closes itself
/// when the last handle and the last lease are dropped.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    steady: SteadyOptions,
    threadsafety: ThreadSafety,
    state: Mutex<PoolState>,
    changed: Condvar,
}

struct PoolState {
    idle: VecDeque<HardenedConnection>,
    shared: Vec<SharedSlot>,
    outstanding: usize,
    wait_count: u64,
    /// Bumped by `close()`; leases from an older epoch are not returned.
    epoch: u64,
}

struct SharedSlot {
    con: HardenedConnection,
    shares: usize,
}

impl SharedSlot {
    /// Slots outside a transaction first, then the least shared.
    fn sort_key(&self) -> (bool, usize) {
        (self.con.in_transaction(), self.shares)
    }
}

#[derive(Clone, Copy, Debug)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }
}

impl ConnectionPool {
    /// Create a pool and open `min_cached` idle connections.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> PoolResult<Self> {
        let threadsafety = parse_threadsafety(connector.threadsafety())
            .map_err(|err| PoolError::Configuration(err.message().to_string()))?;
        if threadsafety == ThreadSafety::Unsafe {
            return Err(PoolError::Configuration(format!(
                "driver {} is not thread-safe",
                connector.name()
            )));
        }
        let config = config.normalized(threadsafety);
        let steady = SteadyOptions::from(&config);

        let mut idle = VecDeque::with_capacity(config.min_cached);
        for _ in 0..config.min_cached {
            idle.push_back(HardenedConnection::connect(
                Arc::clone(&connector),
                steady.clone(),
            )?);
        }

        tracing::info!(
            driver = connector.name(),
            threadsafety = %threadsafety,
            min_cached = config.min_cached,
            max_cached = config.max_cached,
            max_shared = config.max_shared,
            max_connections = config.max_connections,
            blocking = config.blocking,
            "connection pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                steady,
                threadsafety,
                state: Mutex::new(PoolState {
                    idle,
                    shared: Vec::new(),
                    outstanding: 0,
                    wait_count: 0,
                    epoch: 0,
                }),
                changed: Condvar::new(),
            }),
        })
    }

    /// Lease a connection, shared with other callers if `shareable` and the
    /// driver allows it. Blocking waits honor `acquire_timeout_ms`.
    pub fn connection(&self, shareable: bool) -> PoolResult<PooledConnection> {
        let deadline = self.inner.config.acquire_timeout().map(Deadline::after);
        self.inner.acquire(shareable, deadline)
    }

    /// Lease a connection that is not shared with anyone.
    pub fn dedicated_connection(&self) -> PoolResult<PooledConnection> {
        self.connection(false)
    }

    /// Like [`connection`](Self::connection), but a blocking wait gives up
    /// with [`PoolError::AcquireTimeout`] after `timeout`.
    pub fn connection_timeout(
        &self,
        shareable: bool,
        timeout: Duration,
    ) -> PoolResult<PooledConnection> {
        self.inner.acquire(shareable, Some(Deadline::after(timeout)))
    }

    /// An unpooled hardened connection with this pool's settings.
    pub fn steady_connection(&self) -> PoolResult<HardenedConnection> {
        HardenedConnection::connect(Arc::clone(&self.inner.connector), self.inner.steady.clone())
    }

    /// Close all idle and shared connections.
    ///
    /// The pool stays usable; dedicated leases still out are closed when
    /// they are released instead of going back to the cache.
    pub fn close(&self) {
        self.inner.close();
    }

    /// The configuration after normalization.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn threadsafety(&self) -> ThreadSafety {
        self.inner.threadsafety
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        PoolStats {
            idle: state.idle.len(),
            shared: state.shared.len(),
            shares: state.shared.iter().map(|slot| slot.shares).sum(),
            outstanding: state.outstanding,
            wait_count: state.wait_count,
        }
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            driver = self.inner.connector.name(),
            idle = stats.idle,
            shared = stats.shared,
            shares = stats.shares,
            outstanding = stats.outstanding,
            wait_count = stats.wait_count,
            "pool statistics"
        );
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }

    fn at_capacity(&self, state: &PoolState) -> bool {
        self.config.max_connections > 0 && state.outstanding >= self.config.max_connections
    }

    fn acquire(
        self: &Arc<Self>,
        shareable: bool,
        deadline: Option<Deadline>,
    ) -> PoolResult<PooledConnection> {
        let mut state = self.lock_state();

        if shareable && self.config.max_shared > 0 {
            loop {
                while state.shared.is_empty() && self.at_capacity(&state) {
                    state = self.wait(state, deadline)?;
                }

                if state.shared.len() < self.config.max_shared && !self.at_capacity(&state) {
                    let con = self.checkout(&mut state)?;
                    state.outstanding += 1;
                    state.shared.push(SharedSlot {
                        con: con.clone(),
                        shares: 1,
                    });
                    let epoch = state.epoch;
                    drop(state);
                    self.changed.notify_all();
                    return Ok(PooledConnection::shared(Arc::clone(self), con, epoch));
                }

                state.shared.sort_by_key(SharedSlot::sort_key);
                if state
                    .shared
                    .first()
                    .is_none_or(|slot| slot.con.in_transaction())
                {
                    state = self.wait(state, deadline)?;
                    continue;
                }

                let mut slot = state.shared.remove(0);
                slot.con.ping_check(PingContext::Fetch);
                slot.shares += 1;
                let con = slot.con.clone();
                tracing::debug!(
                    connection_id = con.id(),
                    shares = slot.shares,
                    "sharing pooled connection"
                );
                state.shared.push(slot);
                return Ok(PooledConnection::shared(Arc::clone(self), con, state.epoch));
            }
        }

        while self.at_capacity(&state) {
            state = self.wait(state, deadline)?;
        }
        let con = self.checkout(&mut state)?;
        state.outstanding += 1;
        Ok(PooledConnection::dedicated(Arc::clone(self), con, state.epoch))
    }

    /// Take an idle connection or open a new one.
    fn checkout(&self, state: &mut PoolState) -> PoolResult<HardenedConnection> {
        if let Some(con) = state.idle.pop_front() {
            con.ping_check(PingContext::Fetch);
            tracing::debug!(
                connection_id = con.id(),
                idle = state.idle.len(),
                "reused idle connection from pool"
            );
            return Ok(con);
        }
        let con = HardenedConnection::connect(Arc::clone(&self.connector), self.steady.clone())?;
        tracing::debug!(
            connection_id = con.id(),
            outstanding = state.outstanding + 1,
            "created new pooled connection"
        );
        Ok(con)
    }

    fn wait<'a>(
        &self,
        mut state: MutexGuard<'a, PoolState>,
        deadline: Option<Deadline>,
    ) -> PoolResult<MutexGuard<'a, PoolState>> {
        if !self.config.blocking {
            return Err(PoolError::TooManyConnections);
        }
        match deadline {
            None => {
                state.wait_count += 1;
                Ok(self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner))
            }
            Some(deadline) => {
                let remaining = deadline.at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(PoolError::AcquireTimeout(deadline.timeout));
                }
                state.wait_count += 1;
                let (state, _) = self
                    .changed
                    .wait_timeout(state, remaining)
                    .unwrap_or_else(PoisonError::into_inner);
                Ok(state)
            }
        }
    }

    /// Take a connection back from a lease.
    pub(crate) fn release(&self, con: HardenedConnection, shared: bool, epoch: u64) {
        let mut state = self.lock_state();
        if epoch != state.epoch {
            drop(state);
            con.discard();
            tracing::debug!(
                connection_id = con.id(),
                "closed connection leased before pool close"
            );
            return;
        }

        if !shared {
            self.cache(&mut state, con);
        } else if let Some(pos) = state
            .shared
            .iter()
            .position(|slot| slot.con.id() == con.id())
        {
            let slot = &mut state.shared[pos];
            slot.shares -= 1;
            if slot.shares == 0 {
                let slot = state.shared.remove(pos);
                self.cache(&mut state, slot.con);
            }
        }

        drop(state);
        self.changed.notify_all();
    }

    /// Reset a returned connection and keep it idle, or close it when the
    /// idle cache is full.
    fn cache(&self, state: &mut PoolState, con: HardenedConnection) {
        let max_cached = self.config.max_cached;
        if max_cached == 0 || state.idle.len() < max_cached {
            con.reset(self.config.reset == ResetPolicy::Always);
            tracing::debug!(
                connection_id = con.id(),
                idle = state.idle.len() + 1,
                "returned connection to pool"
            );
            state.idle.push_back(con);
        } else {
            con.discard();
            tracing::debug!(
                connection_id = con.id(),
                max_cached = max_cached,
                "closed connection beyond idle cache limit"
            );
        }
        state.outstanding = state.outstanding.saturating_sub(1);
    }

    /// Wake waiters after a shared connection changed transaction state.
    pub(crate) fn notify(&self) {
        drop(self.lock_state());
        self.changed.notify_all();
    }

    fn close(&self) {
        let mut state = self.lock_state();
        let idle = std::mem::take(&mut state.idle);
        let shared = std::mem::take(&mut state.shared);
        let closed = idle.len() + shared.len();
        for con in idle {
            con.discard();
        }
        for slot in shared {
            slot.con.discard();
        }
        state.outstanding = 0;
        state.epoch += 1;
        if closed > 0 {
            tracing::info!(closed = closed, epoch = state.epoch, "connection pool closed");
        }
        drop(state);
        self.changed.notify_all();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("driver", &self.inner.connector.name())
            .field("threadsafety", &self.inner.threadsafety)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
