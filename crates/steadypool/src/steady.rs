//! Hardened connections.
//!
//! A [`HardenedConnection`] owns one raw driver connection and replaces it in
//! place when it is lost, when it has served `max_usage` operations, or when a
//! liveness check fails. The wrapper keeps its identity across reopens; the
//! [`generation`](HardenedConnection::generation) counter tells the raw
//! connections apart.
//!
//! A connection inside a transaction is never replaced silently: recovery
//! still happens, but the error that interrupted the transaction is returned.

mod cursor;

pub use cursor::HardenedCursor;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use steadypool_driver::{
    discard_connection, discard_cursor, parse_threadsafety, Connector, CursorOptions, DriverError,
    DriverResult, Failures, RawConnection, RawCursor, ThreadSafety, Value,
};
use tracing::debug;

use crate::config::{PingContext, PingPolicy, PoolConfig};
use crate::error::{PoolError, PoolResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Behavior of a single hardened connection.
#[derive(Clone, Debug, PartialEq)]
pub struct SteadyOptions {
    /// Operations before the raw connection is reopened, 0 for no limit.
    pub max_usage: u64,
    /// Statements run on every freshly opened raw connection.
    pub set_session: Vec<String>,
    /// Recoverable error kinds; the driver's default when unset.
    pub failures: Option<Failures>,
    pub ping: PingPolicy,
    /// Whether `close()` really closes. When false it only rolls back an
    /// open transaction.
    pub closeable: bool,
}

impl Default for SteadyOptions {
    fn default() -> Self {
        Self {
            max_usage: 0,
            set_session: Vec::new(),
            failures: None,
            ping: PingPolicy::default(),
            closeable: true,
        }
    }
}

impl SteadyOptions {
    pub fn with_max_usage(self, max_usage: u64) -> Self {
        Self { max_usage, ..self }
    }

    pub fn with_set_session(self, set_session: Vec<String>) -> Self {
        Self {
            set_session,
            ..self
        }
    }

    pub fn with_failures(self, failures: Failures) -> Self {
        Self {
            failures: Some(failures),
            ..self
        }
    }

    pub fn with_ping(self, ping: PingPolicy) -> Self {
        Self { ping, ..self }
    }

    pub fn with_closeable(self, closeable: bool) -> Self {
        Self { closeable, ..self }
    }
}

impl From<&PoolConfig> for SteadyOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_usage: config.max_usage,
            set_session: config.set_session.clone(),
            failures: config.failures.clone(),
            ping: config.ping,
            closeable: true,
        }
    }
}

/// Operations shared by hardened connections and pool leases.
pub trait Connection {
    fn cursor_with(&self, options: CursorOptions) -> PoolResult<HardenedCursor>;

    fn cursor(&self) -> PoolResult<HardenedCursor> {
        self.cursor_with(CursorOptions::default())
    }

    fn commit(&self) -> PoolResult<()>;

    fn rollback(&self) -> PoolResult<()>;

    /// Mark the start of a transaction, passing `args` to the driver's
    /// `begin` extension.
    fn begin(&self, args: &[Value]) -> PoolResult<()>;

    fn cancel(&self) -> PoolResult<()>;

    fn ping(&self) -> PoolResult<()>;

    fn close(&mut self) -> PoolResult<()>;

    /// Run `body` inside a transaction: commit when it returns `Ok`, roll
    /// back when it returns `Err`.
    fn transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        Self: Sized,
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<PoolError>,
    {
        self.begin(&[])?;
        match body(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.rollback() {
                    debug!(error = %rollback, "rollback after failed transaction body failed");
                }
                Err(err)
            }
        }
    }
}

/// A self-reconnecting database connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct HardenedConnection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    id: u64,
    connector: Arc<dyn Connector>,
    options: SteadyOptions,
    failures: Failures,
    threadsafety: ThreadSafety,
    transaction: AtomicBool,
    state: Mutex<ConnectionState>,
}

pub(crate) struct ConnectionState {
    raw: Box<dyn RawConnection>,
    usage: u64,
    generation: u64,
    closed: bool,
}

enum Finish {
    Commit,
    Rollback,
}

/// Open a raw connection and prepare its session.
fn open(connector: &dyn Connector, set_session: &[String]) -> DriverResult<Box<dyn RawConnection>> {
    let mut raw = connector.connect()?;
    if set_session.is_empty() {
        return Ok(raw);
    }
    if let Err(err) = prepare_session(raw.as_mut(), set_session) {
        discard_connection(raw);
        return Err(err);
    }
    Ok(raw)
}

fn prepare_session(raw: &mut dyn RawConnection, statements: &[String]) -> DriverResult<()> {
    let mut cursor = raw.cursor(&CursorOptions::default())?;
    for sql in statements {
        if let Err(err) = cursor.execute(sql, &[]) {
            discard_cursor(cursor);
            return Err(err);
        }
    }
    cursor.close()
}

impl HardenedConnection {
    /// Open a hardened connection through `connector`.
    pub fn connect(connector: Arc<dyn Connector>, options: SteadyOptions) -> PoolResult<Self> {
        let threadsafety = parse_threadsafety(connector.threadsafety())
            .map_err(|err| PoolError::Configuration(err.message().to_string()))?;
        let failures = options
            .failures
            .clone()
            .or_else(|| connector.failures())
            .unwrap_or_default();
        let raw = open(connector.as_ref(), &options.set_session)?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, driver = connector.name(), "opened hardened connection");

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                id,
                connector,
                options,
                failures,
                threadsafety,
                transaction: AtomicBool::new(false),
                state: Mutex::new(ConnectionState {
                    raw,
                    usage: 0,
                    generation: 1,
                    closed: false,
                }),
            }),
        })
    }

    /// Identity of this wrapper, stable across reopens.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of raw connections opened by this wrapper so far.
    pub fn generation(&self) -> u64 {
        self.inner.lock_state().generation
    }

    /// Operations served by the current raw connection.
    pub fn usage(&self) -> u64 {
        self.inner.lock_state().usage
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    pub fn threadsafety(&self) -> ThreadSafety {
        self.inner.threadsafety
    }

    pub fn failures(&self) -> &Failures {
        &self.inner.failures
    }

    pub fn options(&self) -> &SteadyOptions {
        &self.inner.options
    }

    /// Run the liveness check for `context`. `None` when the ping policy
    /// does not cover it, otherwise whether the connection is alive.
    pub fn ping_check(&self, context: PingContext) -> Option<bool> {
        let mut state = self.inner.lock_state();
        self.inner.ping_check(&mut state, context)
    }

    /// Roll back unless closed; unless `force`, only inside a transaction.
    pub(crate) fn reset(&self, force: bool) {
        let mut state = self.inner.lock_state();
        self.inner.reset(&mut state, force);
    }

    /// Close the raw connection whatever the `closeable` setting.
    pub(crate) fn discard(&self) {
        let mut state = self.inner.lock_state();
        self.inner.close_raw(&mut state);
    }
}

impl Connection for HardenedConnection {
    fn cursor_with(&self, options: CursorOptions) -> PoolResult<HardenedCursor> {
        HardenedCursor::open(Arc::clone(&self.inner), options)
    }

    fn commit(&self) -> PoolResult<()> {
        let mut state = self.inner.lock_state();
        Ok(self.inner.finish(&mut state, Finish::Commit)?)
    }

    fn rollback(&self) -> PoolResult<()> {
        let mut state = self.inner.lock_state();
        Ok(self.inner.finish(&mut state, Finish::Rollback)?)
    }

    fn begin(&self, args: &[Value]) -> PoolResult<()> {
        let mut state = self.inner.lock_state();
        self.inner.transaction.store(true, Ordering::SeqCst);
        Ok(state.raw.begin(args)?)
    }

    fn cancel(&self) -> PoolResult<()> {
        let mut state = self.inner.lock_state();
        self.inner.transaction.store(false, Ordering::SeqCst);
        Ok(state.raw.cancel()?)
    }

    fn ping(&self) -> PoolResult<()> {
        Ok(self.inner.lock_state().raw.ping()?)
    }

    fn close(&mut self) -> PoolResult<()> {
        let mut state = self.inner.lock_state();
        if self.inner.options.closeable {
            self.inner.close_raw(&mut state);
        } else if self.inner.in_transaction() {
            self.inner.reset(&mut state, false);
        }
        Ok(())
    }
}

impl fmt::Debug for HardenedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardenedConnection")
            .field("id", &self.inner.id)
            .field("driver", &self.inner.connector.name())
            .field("in_transaction", &self.inner.in_transaction())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.closed {
            if let Err(err) = state.raw.close() {
                debug!(connection_id = self.id, error = %err, "ignored error while dropping connection");
            }
        }
    }
}

impl ConnectionInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        lock(&self.state)
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction.load(Ordering::SeqCst)
    }

    pub(crate) fn failures(&self) -> &Failures {
        &self.failures
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn create(&self) -> DriverResult<Box<dyn RawConnection>> {
        open(self.connector.as_ref(), &self.options.set_session)
    }

    /// A new raw connection with a cursor already open on it.
    pub(crate) fn create_with_cursor(
        &self,
        options: &CursorOptions,
    ) -> DriverResult<(Box<dyn RawConnection>, Box<dyn RawCursor>)> {
        let mut raw = self.create()?;
        match raw.cursor(options) {
            Ok(cursor) => Ok((raw, cursor)),
            Err(err) => {
                discard_connection(raw);
                Err(err)
            }
        }
    }

    /// Replace the raw connection, closing the old one.
    pub(crate) fn store(&self, state: &mut ConnectionState, raw: Box<dyn RawConnection>) {
        let old = std::mem::replace(&mut state.raw, raw);
        if !state.closed {
            discard_connection(old);
        }
        state.closed = false;
        state.usage = 0;
        state.generation += 1;
        self.transaction.store(false, Ordering::SeqCst);
        debug!(
            connection_id = self.id,
            generation = state.generation,
            "reopened raw connection"
        );
    }

    fn close_raw(&self, state: &mut ConnectionState) {
        if state.closed {
            return;
        }
        if let Err(err) = state.raw.close() {
            debug!(connection_id = self.id, error = %err, "ignored error while closing connection");
        }
        state.closed = true;
        self.transaction.store(false, Ordering::SeqCst);
        debug!(connection_id = self.id, "closed connection");
    }

    fn reset(&self, state: &mut ConnectionState, force: bool) {
        if state.closed || !(force || self.in_transaction()) {
            return;
        }
        if let Err(err) = self.finish(state, Finish::Rollback) {
            debug!(connection_id = self.id, error = %err, "ignored error during reset");
        }
    }

    fn finish(&self, state: &mut ConnectionState, finish: Finish) -> DriverResult<()> {
        self.transaction.store(false, Ordering::SeqCst);
        let result = match finish {
            Finish::Commit => state.raw.commit(),
            Finish::Rollback => state.raw.rollback(),
        };
        let Err(error) = result else {
            return Ok(());
        };
        if self.failures.is_recoverable(&error) {
            match self.create() {
                Ok(raw) => self.store(state, raw),
                Err(err) => debug!(connection_id = self.id, error = %err, "reopen failed"),
            }
        }
        Err(error)
    }

    pub(crate) fn ping_check(&self, state: &mut ConnectionState, context: PingContext) -> Option<bool> {
        if !self.options.ping.covers(context) {
            return None;
        }
        let error = match state.raw.ping() {
            Ok(()) => return Some(true),
            Err(err) => err,
        };
        debug!(connection_id = self.id, error = %error, "ping failed");
        if self.in_transaction() {
            return Some(false);
        }
        match self.create() {
            Ok(raw) => {
                self.store(state, raw);
                Some(true)
            }
            Err(err) => {
                debug!(connection_id = self.id, error = %err, "could not reopen dead connection");
                Some(false)
            }
        }
    }

    /// Fail with a recoverable error when the raw connection must not be
    /// used any more.
    pub(crate) fn ensure_usable(&self, state: &ConnectionState) -> DriverResult<()> {
        if state.closed {
            return Err(DriverError::new(self.failures.primary(), "connection is closed"));
        }
        let limit = self.options.max_usage;
        if limit > 0 && state.usage >= limit {
            return Err(DriverError::new(
                self.failures.primary(),
                format!("connection reached its usage limit of {limit}"),
            ));
        }
        Ok(())
    }

    pub(crate) fn record_use(&self, state: &mut ConnectionState) {
        state.usage += 1;
    }

    /// A raw cursor on the current raw connection, reopening it when needed.
    pub(crate) fn raw_cursor(
        &self,
        state: &mut ConnectionState,
        options: &CursorOptions,
    ) -> DriverResult<Box<dyn RawCursor>> {
        let transaction = self.in_transaction();
        if !transaction {
            self.ping_check(state, PingContext::Cursor);
        }
        let error = match self
            .ensure_usable(state)
            .and_then(|()| state.raw.cursor(options))
        {
            Ok(cursor) => return Ok(cursor),
            Err(err) => err,
        };
        if !self.failures.is_recoverable(&error) {
            return Err(error);
        }

        match self.create_with_cursor(options) {
            Ok((raw, cursor)) => {
                self.store(state, raw);
                if !transaction {
                    return Ok(cursor);
                }
                discard_cursor(cursor);
            }
            Err(err) => {
                debug!(connection_id = self.id, error = %err, "reconnect for cursor failed");
            }
        }
        self.transaction.store(false, Ordering::SeqCst);
        Err(error)
    }
}
