//! Hardened cursors.
//!
//! Statement execution is retried through a short recovery ladder when the
//! driver reports a recoverable failure. Fetches are never retried: once a
//! result is being consumed, a new cursor could not resume it.

use std::fmt;
use std::sync::Arc;

use steadypool_driver::{
    discard_connection, discard_cursor, CursorOptions, DriverResult, RawCursor, Row, Value,
};
use tracing::debug;

use super::ConnectionInner;
use crate::config::PingContext;
use crate::error::{PoolError, PoolResult};

/// One recovery attempt after a recoverable execution failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Recovery {
    /// Open a new cursor on the current connection and retry.
    FreshCursor,
    /// Open a new raw connection and cursor and retry.
    Reconnect,
}

const RECOVERY_LADDER: [Recovery; 2] = [Recovery::FreshCursor, Recovery::Reconnect];

/// Size hints held until the next execute.
#[derive(Debug, Default)]
struct SizeHints {
    input: Vec<usize>,
    output: Vec<(usize, Option<usize>)>,
}

impl SizeHints {
    fn apply(&self, cursor: &mut dyn RawCursor) -> DriverResult<()> {
        if !self.input.is_empty() {
            cursor.setinputsizes(&self.input)?;
        }
        for &(size, column) in &self.output {
            cursor.setoutputsize(size, column)?;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
    }
}

/// A cursor on a [`HardenedConnection`](super::HardenedConnection).
pub struct HardenedCursor {
    con: Arc<ConnectionInner>,
    raw: Option<Box<dyn RawCursor>>,
    options: CursorOptions,
    sizes: SizeHints,
}

impl HardenedCursor {
    pub(crate) fn open(con: Arc<ConnectionInner>, options: CursorOptions) -> PoolResult<Self> {
        let raw = {
            let mut state = con.lock_state();
            con.raw_cursor(&mut state, &options)?
        };
        Ok(Self {
            con,
            raw: Some(raw),
            options,
            sizes: SizeHints::default(),
        })
    }

    pub fn execute(&mut self, sql: &str, params: &[Value]) -> PoolResult<()> {
        self.tough(true, |cursor| cursor.execute(sql, params))
    }

    pub fn executemany(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> PoolResult<()> {
        self.tough(true, |cursor| cursor.executemany(sql, param_sets))
    }

    pub fn callproc(&mut self, name: &str, params: &[Value]) -> PoolResult<Vec<Value>> {
        self.tough(false, |cursor| cursor.callproc(name, params))
    }

    pub fn fetchone(&mut self) -> PoolResult<Option<Row>> {
        self.fetch(|cursor| cursor.fetchone())
    }

    pub fn fetchmany(&mut self, size: usize) -> PoolResult<Vec<Row>> {
        self.fetch(|cursor| cursor.fetchmany(size))
    }

    pub fn fetchall(&mut self) -> PoolResult<Vec<Row>> {
        self.fetch(|cursor| cursor.fetchall())
    }

    /// Store input sizes for the next execute.
    pub fn setinputsizes(&mut self, sizes: &[usize]) -> PoolResult<()> {
        self.check_open()?;
        self.sizes.input = sizes.to_vec();
        Ok(())
    }

    /// Store an output size for the next execute; `column = None` applies to
    /// all large columns.
    pub fn setoutputsize(&mut self, size: usize, column: Option<usize>) -> PoolResult<()> {
        self.check_open()?;
        self.sizes.output.retain(|&(_, c)| c != column);
        self.sizes.output.push((size, column));
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_none()
    }

    pub fn close(&mut self) {
        if let Some(raw) = self.raw.take() {
            discard_cursor(raw);
        }
    }

    fn check_open(&self) -> PoolResult<()> {
        if self.raw.is_none() {
            return Err(PoolError::InvalidCursor);
        }
        Ok(())
    }

    fn fetch<T>(&mut self, op: impl FnOnce(&mut dyn RawCursor) -> DriverResult<T>) -> PoolResult<T> {
        let raw = self.raw.as_mut().ok_or(PoolError::InvalidCursor)?;
        let _state = self.con.lock_state();
        Ok(op(raw.as_mut())?)
    }

    fn adopt(&mut self, cursor: Box<dyn RawCursor>) {
        if let Some(old) = self.raw.replace(cursor) {
            discard_cursor(old);
        }
    }

    fn run<T>(
        sizes: &mut SizeHints,
        cursor: &mut dyn RawCursor,
        execute: bool,
        op: &mut impl FnMut(&mut dyn RawCursor) -> DriverResult<T>,
    ) -> DriverResult<T> {
        if execute {
            sizes.apply(cursor)?;
        }
        let value = op(cursor)?;
        if execute {
            sizes.clear();
        }
        Ok(value)
    }

    /// Run `op`, walking the recovery ladder on a recoverable failure.
    fn tough<T>(
        &mut self,
        execute: bool,
        mut op: impl FnMut(&mut dyn RawCursor) -> DriverResult<T>,
    ) -> PoolResult<T> {
        self.check_open()?;
        let con = Arc::clone(&self.con);
        let mut state = con.lock_state();
        let transaction = con.in_transaction();
        if !transaction {
            con.ping_check(&mut state, PingContext::Execute);
        }

        let first = match self.raw.as_mut() {
            Some(raw) => con
                .ensure_usable(&state)
                .and_then(|()| Self::run(&mut self.sizes, raw.as_mut(), execute, &mut op)),
            None => return Err(PoolError::InvalidCursor),
        };
        let error = match first {
            Ok(value) => {
                con.record_use(&mut state);
                return Ok(value);
            }
            Err(err) => err,
        };
        if !con.failures().is_recoverable(&error) {
            return Err(error.into());
        }

        for step in RECOVERY_LADDER {
            match step {
                Recovery::FreshCursor => {
                    if transaction {
                        continue;
                    }
                    let mut cursor = match con.raw_cursor(&mut state, &self.options) {
                        Ok(cursor) => cursor,
                        Err(err) => {
                            debug!(connection_id = con.id(), error = %err, "fresh cursor failed");
                            continue;
                        }
                    };
                    match Self::run(&mut self.sizes, cursor.as_mut(), execute, &mut op) {
                        Ok(value) => {
                            self.adopt(cursor);
                            con.record_use(&mut state);
                            return Ok(value);
                        }
                        Err(err) => {
                            debug!(connection_id = con.id(), error = %err, "retry on fresh cursor failed");
                            discard_cursor(cursor);
                        }
                    }
                }
                Recovery::Reconnect => {
                    let (raw_con, mut cursor) = match con.create_with_cursor(&self.options) {
                        Ok(pair) => pair,
                        Err(err) => {
                            debug!(connection_id = con.id(), error = %err, "reconnect failed");
                            continue;
                        }
                    };
                    if transaction {
                        con.store(&mut state, raw_con);
                        self.adopt(cursor);
                        return Err(error.into());
                    }
                    match Self::run(&mut self.sizes, cursor.as_mut(), execute, &mut op) {
                        Ok(value) => {
                            con.store(&mut state, raw_con);
                            self.adopt(cursor);
                            con.record_use(&mut state);
                            return Ok(value);
                        }
                        Err(err) if con.failures().is_recoverable(&err) => {
                            debug!(connection_id = con.id(), error = %err, "retry after reconnect failed");
                            discard_cursor(cursor);
                            discard_connection(raw_con);
                        }
                        Err(err) => {
                            debug!(connection_id = con.id(), error = %err, "retry after reconnect failed");
                            con.store(&mut state, raw_con);
                            self.adopt(cursor);
                        }
                    }
                }
            }
        }
        Err(error.into())
    }
}

impl Drop for HardenedCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for HardenedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardenedCursor")
            .field("connection_id", &self.con.id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use steadypool_driver::mock::MockDriver;
    use steadypool_driver::{Connector, ErrorKind, Failures, Value};

    use crate::config::PingPolicy;
    use crate::error::PoolError;
    use crate::steady::{Connection, HardenedConnection, SteadyOptions};

    fn connect(driver: &Arc<MockDriver>, options: SteadyOptions) -> HardenedConnection {
        HardenedConnection::connect(Arc::clone(driver) as Arc<dyn Connector>, options).unwrap()
    }

    fn text(row: Option<Vec<Value>>) -> String {
        row.and_then(|r| r.into_iter().next())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    // ── Basic use ───────────────────────────────────────────────────

    #[test]
    fn execute_and_fetch_count_usage() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let mut cursor = con.cursor().unwrap();
        cursor.execute("select hello", &[]).unwrap();
        assert_eq!(text(cursor.fetchone().unwrap()), "hello");
        cursor
            .executemany("select x", &[vec![Value::Int(1)], vec![Value::Int(2)]])
            .unwrap();
        assert_eq!(cursor.fetchall().unwrap().len(), 1);
        assert!(cursor.fetchmany(3).unwrap().is_empty());
        assert_eq!(
            cursor.callproc("proc", &[Value::Int(9)]).unwrap(),
            vec![Value::Int(9)]
        );
        assert_eq!(con.usage(), 3);
    }

    #[test]
    fn closed_cursor_is_invalid() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let mut cursor = con.cursor().unwrap();
        cursor.close();
        cursor.close();
        assert!(cursor.is_closed());
        assert!(matches!(cursor.execute("select 1", &[]), Err(PoolError::InvalidCursor)));
        assert!(matches!(cursor.fetchone(), Err(PoolError::InvalidCursor)));
        assert!(matches!(cursor.setinputsizes(&[1]), Err(PoolError::InvalidCursor)));
        let id = driver.last_connection_id().unwrap();
        assert_eq!(driver.record(id).unwrap().open_cursors, 0);
    }

    #[test]
    fn dropping_cursor_closes_raw_cursor() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let id = driver.last_connection_id().unwrap();
        {
            let _cursor = con.cursor().unwrap();
            assert_eq!(driver.record(id).unwrap().open_cursors, 1);
        }
        assert_eq!(driver.record(id).unwrap().open_cursors, 0);
    }

    #[test]
    fn size_hints_apply_to_next_execute_only() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let mut cursor = con.cursor().unwrap();
        cursor.setinputsizes(&[4, 8]).unwrap();
        cursor.setoutputsize(16, None).unwrap();
        cursor.setoutputsize(32, Some(2)).unwrap();
        cursor.execute("get sizes", &[]).unwrap();
        let row = cursor.fetchone().unwrap().unwrap();
        assert_eq!(row, vec![Value::from("[4, 8]"), Value::from("*:16,2:32")]);

        cursor.execute("get sizes", &[]).unwrap();
        let row = cursor.fetchone().unwrap().unwrap();
        assert_eq!(row, vec![Value::from("[]"), Value::from("")]);
    }

    // ── Recovery ────────────────────────────────────────────────────

    #[test]
    fn execute_recovers_after_disconnect() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let mut cursor = con.cursor().unwrap();
        cursor.execute("select a", &[]).unwrap();
        cursor.execute("select b", &[]).unwrap();
        assert_eq!(con.usage(), 2);

        driver.disconnect_all();
        cursor.execute("select c", &[]).unwrap();
        assert_eq!(text(cursor.fetchone().unwrap()), "c");
        assert_eq!(con.generation(), 2);
        assert_eq!(con.usage(), 1);
    }

    #[test]
    fn cursor_creation_recovers_after_disconnect() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        driver.disconnect_all();
        let mut cursor = con.cursor().unwrap();
        cursor.execute("select ok", &[]).unwrap();
        assert_eq!(con.generation(), 2);
    }

    #[test]
    fn unrecoverable_error_is_not_retried() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let mut cursor = con.cursor().unwrap();
        let err = cursor.execute("drop table", &[]).unwrap_err();
        assert_eq!(err.driver_kind(), Some(ErrorKind::Programming));
        assert_eq!(driver.connects(), 1);
        assert_eq!(con.usage(), 0);
    }

    #[test]
    fn fetch_is_never_recovered() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let mut cursor = con.cursor().unwrap();
        cursor.execute("select a", &[]).unwrap();
        driver.disconnect_all();
        let err = cursor.fetchone().unwrap_err();
        assert_eq!(err.driver_kind(), Some(ErrorKind::Internal));
        assert_eq!(driver.connects(), 1);
        assert_eq!(con.generation(), 1);
    }

    #[test]
    fn recovery_inside_transaction_returns_original_error() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let mut cursor = con.cursor().unwrap();
        con.begin(&[]).unwrap();
        driver.disconnect_all();

        let err = cursor.execute("select lost", &[]).unwrap_err();
        assert_eq!(err.driver_kind(), Some(ErrorKind::Internal));
        assert_eq!(con.generation(), 2);
        assert!(!con.in_transaction());

        cursor.execute("select again", &[]).unwrap();
        assert_eq!(text(cursor.fetchone().unwrap()), "again");
    }

    #[test]
    fn failing_reconnect_returns_original_error() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let mut cursor = con.cursor().unwrap();
        driver.disconnect_all();
        driver.fail_next_connects(2);

        let err = cursor.execute("select x", &[]).unwrap_err();
        assert_eq!(err.driver_kind(), Some(ErrorKind::Internal));
        assert_eq!(con.generation(), 1);

        cursor.execute("select y", &[]).unwrap();
        assert_eq!(con.generation(), 2);
    }

    #[test]
    fn reconnected_connection_is_kept_when_retry_fails_otherwise() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let mut cursor = con.cursor().unwrap();
        driver.disconnect_all();
        driver.fail_next_connects(1);

        let err = cursor.execute("bogus", &[]).unwrap_err();
        assert_eq!(err.driver_kind(), Some(ErrorKind::Internal));
        assert_eq!(con.generation(), 2);
        assert_eq!(driver.open_connections(), 1);
    }

    #[test]
    fn custom_failures_limit_recovery() {
        let driver = Arc::new(MockDriver::new(1));
        let options = SteadyOptions::default().with_failures(Failures::new([ErrorKind::Operational]));
        let con = connect(&driver, options);
        let mut cursor = con.cursor().unwrap();
        driver.disconnect_all();
        let err = cursor.execute("select x", &[]).unwrap_err();
        assert_eq!(err.driver_kind(), Some(ErrorKind::Internal));
        assert_eq!(driver.connects(), 1);
    }

    // ── Max usage ───────────────────────────────────────────────────

    #[test]
    fn max_usage_rolls_over_raw_connection() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default().with_max_usage(5));
        let mut cursor = con.cursor().unwrap();
        for i in 0..12 {
            cursor.execute(&format!("select {i}"), &[]).unwrap();
            assert_eq!(text(cursor.fetchone().unwrap()), i.to_string());
            assert!(con.usage() <= 5);
        }
        assert_eq!(con.generation(), 3);
        assert_eq!(driver.connects(), 3);
        assert_eq!(con.usage(), 2);
        assert_eq!(driver.open_connections(), 1);
    }

    #[test]
    fn max_usage_reached_on_cursor_creation_reopens() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default().with_max_usage(1));
        let mut cursor = con.cursor().unwrap();
        cursor.execute("select 1", &[]).unwrap();
        let _second = con.cursor().unwrap();
        assert_eq!(con.generation(), 2);
        assert_eq!(con.usage(), 0);
    }

    // ── Ping ────────────────────────────────────────────────────────

    #[test]
    fn ping_on_execute_reopens_before_running() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default().with_ping(PingPolicy::ON_EXECUTE));
        let mut cursor = con.cursor().unwrap();
        let first = driver.last_connection_id().unwrap();
        assert_eq!(driver.record(first).unwrap().pings, 0);
        driver.disconnect_all();
        cursor.execute("select a", &[]).unwrap();
        assert_eq!(con.generation(), 2);
        assert_eq!(driver.record(first).unwrap().pings, 1);
    }

    #[test]
    fn named_cursor_failure_reports_original_error() {
        let driver = Arc::new(MockDriver::new(1));
        let con = connect(&driver, SteadyOptions::default());
        let err = con
            .cursor_with(steadypool_driver::CursorOptions::named("error"))
            .unwrap_err();
        assert_eq!(err.driver_kind(), Some(ErrorKind::Operational));
        assert_eq!(driver.open_connections(), 1);
    }
}
