//! In-memory mock driver for tests.
//!
//! Statements understood by [`MockCursor::execute`]:
//!
//! - `select <text>`: produces one row holding `<text>`
//! - `set <text>`: appends `<text>` to the connection's session log
//! - `get sizes`: produces one row describing the size hints in effect
//! - anything else: programming error
//!
//! [`MockDriver::disconnect_all`] simulates a server restart: every
//! connection opened so far becomes invalid and fails with internal errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connector::{Connector, CursorOptions, RawConnection, RawCursor};
use crate::error::{DriverError, DriverResult, Failures};
use crate::value::{Row, Value};

/// Observable state of one mock connection.
#[derive(Clone, Debug, Default)]
pub struct ConnectionRecord {
    pub valid: bool,
    /// `set` statements, commits, rollbacks, begins and cancels, in order.
    pub session: Vec<String>,
    pub uses: u64,
    pub queries: u64,
    pub open_cursors: usize,
    pub pings: u64,
}

type Record = Arc<Mutex<ConnectionRecord>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`Connector`] producing [`MockConnection`]s.
pub struct MockDriver {
    threadsafety: Option<u8>,
    failures: Option<Failures>,
    next_id: AtomicU64,
    connects: AtomicU64,
    closes: Arc<AtomicU64>,
    fail_connects: AtomicUsize,
    ping_supported: AtomicBool,
    records: Mutex<HashMap<u64, Record>>,
}

impl MockDriver {
    pub fn new(threadsafety: u8) -> Self {
        Self::with_threadsafety(Some(threadsafety))
    }

    /// A driver that may not report any thread-safety level.
    pub fn with_threadsafety(threadsafety: Option<u8>) -> Self {
        Self {
            threadsafety,
            failures: None,
            next_id: AtomicU64::new(1),
            connects: AtomicU64::new(0),
            closes: Arc::new(AtomicU64::new(0)),
            fail_connects: AtomicUsize::new(0),
            ping_supported: AtomicBool::new(true),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Builder method: report custom transient error kinds.
    pub fn with_failures(self, failures: Failures) -> Self {
        Self {
            failures: Some(failures),
            ..self
        }
    }

    /// Make the next `n` connection attempts fail with an operational error.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Toggle whether `ping()` is available on connections opened afterwards.
    pub fn set_ping_supported(&self, supported: bool) {
        self.ping_supported.store(supported, Ordering::SeqCst);
    }

    /// Invalidate every connection opened so far.
    pub fn disconnect_all(&self) {
        for record in lock(&self.records).values() {
            lock(record).valid = false;
        }
    }

    /// Invalidate a single connection.
    pub fn disconnect(&self, id: u64) {
        if let Some(record) = lock(&self.records).get(&id) {
            lock(record).valid = false;
        }
    }

    /// Number of successful connection attempts.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of connections closed by their owner.
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Connections that are still valid (neither closed nor disconnected).
    pub fn open_connections(&self) -> usize {
        lock(&self.records)
            .values()
            .filter(|r| lock(r).valid)
            .count()
    }

    /// Snapshot of a connection's record.
    pub fn record(&self, id: u64) -> Option<ConnectionRecord> {
        lock(&self.records).get(&id).map(|r| lock(r).clone())
    }

    /// Id of the most recently opened connection.
    pub fn last_connection_id(&self) -> Option<u64> {
        lock(&self.records).keys().max().copied()
    }
}

impl Connector for MockDriver {
    fn connect(&self) -> DriverResult<Box<dyn RawConnection>> {
        let pending = self.fail_connects.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_connects.store(pending - 1, Ordering::SeqCst);
            return Err(DriverError::operational("could not connect to server"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = Arc::new(Mutex::new(ConnectionRecord {
            valid: true,
            ..ConnectionRecord::default()
        }));
        lock(&self.records).insert(id, Arc::clone(&record));
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockConnection {
            id,
            record,
            ping_supported: self.ping_supported.load(Ordering::SeqCst),
            closes: Arc::clone(&self.closes),
        }))
    }

    fn threadsafety(&self) -> Option<u8> {
        self.threadsafety
    }

    fn failures(&self) -> Option<Failures> {
        self.failures.clone()
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// A connection handed out by [`MockDriver`].
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    record: Record,
    ping_supported: bool,
    closes: Arc<AtomicU64>,
}

impl MockConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_valid(&self) -> DriverResult<()> {
        if lock(&self.record).valid {
            Ok(())
        } else {
            Err(DriverError::internal(format!("connection {} is not valid", self.id)))
        }
    }

    fn log(&self, entry: &str) -> DriverResult<()> {
        self.check_valid()?;
        lock(&self.record).session.push(entry.to_string());
        Ok(())
    }
}

impl RawConnection for MockConnection {
    fn cursor(&mut self, options: &CursorOptions) -> DriverResult<Box<dyn RawCursor>> {
        self.check_valid()?;
        if options.name.as_deref() == Some("error") {
            return Err(DriverError::operational("cannot open cursor named 'error'"));
        }
        lock(&self.record).open_cursors += 1;
        Ok(Box::new(MockCursor {
            connection_id: self.id,
            record: Arc::clone(&self.record),
            valid: true,
            result: None,
            input_sizes: Vec::new(),
            output_sizes: Vec::new(),
        }))
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.log("commit")
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.log("rollback")
    }

    fn ping(&mut self) -> DriverResult<()> {
        lock(&self.record).pings += 1;
        if !self.ping_supported {
            return Err(DriverError::not_supported("ping"));
        }
        if !lock(&self.record).valid {
            return Err(DriverError::operational("server closed the connection"));
        }
        Ok(())
    }

    fn begin(&mut self, args: &[Value]) -> DriverResult<()> {
        if args.is_empty() {
            self.log("begin")
        } else {
            let args: Vec<String> = args.iter().map(ToString::to_string).collect();
            self.log(&format!("begin {}", args.join(" ")))
        }
    }

    fn cancel(&mut self) -> DriverResult<()> {
        self.log("cancel")
    }

    fn close(&mut self) -> DriverResult<()> {
        self.check_valid()?;
        let mut record = lock(&self.record);
        record.valid = false;
        record.open_cursors = 0;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A cursor handed out by [`MockConnection`].
#[derive(Debug)]
pub struct MockCursor {
    connection_id: u64,
    record: Record,
    valid: bool,
    result: Option<Row>,
    input_sizes: Vec<usize>,
    output_sizes: Vec<(Option<usize>, usize)>,
}

impl MockCursor {
    fn check_valid(&self) -> DriverResult<()> {
        if !self.valid {
            return Err(DriverError::internal("cursor is closed"));
        }
        if !lock(&self.record).valid {
            return Err(DriverError::internal(format!(
                "connection {} is not valid",
                self.connection_id
            )));
        }
        Ok(())
    }

    fn run(&mut self, sql: &str) -> DriverResult<()> {
        self.check_valid()?;
        let mut record = lock(&self.record);
        record.uses += 1;
        if let Some(rest) = sql.strip_prefix("select ") {
            record.queries += 1;
            self.result = Some(vec![Value::Text(rest.to_string())]);
        } else if let Some(rest) = sql.strip_prefix("set ") {
            record.session.push(rest.to_string());
            self.result = None;
        } else if sql == "get sizes" {
            let outputs: Vec<String> = self
                .output_sizes
                .iter()
                .map(|(col, size)| match col {
                    Some(col) => format!("{col}:{size}"),
                    None => format!("*:{size}"),
                })
                .collect();
            self.result = Some(vec![
                Value::Text(format!("{:?}", self.input_sizes)),
                Value::Text(outputs.join(",")),
            ]);
            self.input_sizes.clear();
            self.output_sizes.clear();
        } else {
            return Err(DriverError::programming(format!("cannot execute {sql:?}")));
        }
        Ok(())
    }
}

impl RawCursor for MockCursor {
    fn execute(&mut self, sql: &str, _params: &[Value]) -> DriverResult<()> {
        self.run(sql)
    }

    fn executemany(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> DriverResult<()> {
        for _ in param_sets {
            self.run(sql)?;
        }
        Ok(())
    }

    fn callproc(&mut self, name: &str, params: &[Value]) -> DriverResult<Vec<Value>> {
        self.check_valid()?;
        if name.is_empty() {
            return Err(DriverError::internal("empty procedure name"));
        }
        lock(&self.record).uses += 1;
        Ok(params.to_vec())
    }

    fn fetchone(&mut self) -> DriverResult<Option<Row>> {
        self.check_valid()?;
        Ok(self.result.take())
    }

    fn setinputsizes(&mut self, sizes: &[usize]) -> DriverResult<()> {
        self.check_valid()?;
        self.input_sizes = sizes.to_vec();
        Ok(())
    }

    fn setoutputsize(&mut self, size: usize, column: Option<usize>) -> DriverResult<()> {
        self.check_valid()?;
        self.output_sizes.retain(|(col, _)| *col != column);
        self.output_sizes.push((column, size));
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        if !self.valid {
            return Err(DriverError::internal("cursor already closed"));
        }
        self.valid = false;
        let mut record = lock(&self.record);
        record.open_cursors = record.open_cursors.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(cursor: &mut dyn RawCursor, text: &str) -> Option<Row> {
        cursor.execute(&format!("select {text}"), &[]).unwrap();
        cursor.fetchone().unwrap()
    }

    #[test]
    fn connect_counts_and_records() {
        let driver = MockDriver::new(2);
        let mut con = driver.connect().unwrap();
        assert_eq!(driver.connects(), 1);
        let id = driver.last_connection_id().unwrap();

        let mut cursor = con.cursor(&CursorOptions::default()).unwrap();
        assert_eq!(select(cursor.as_mut(), "hello"), Some(vec![Value::from("hello")]));
        cursor.execute("set datestyle", &[]).unwrap();
        con.commit().unwrap();

        let record = driver.record(id).unwrap();
        assert_eq!(record.uses, 2);
        assert_eq!(record.queries, 1);
        assert_eq!(record.open_cursors, 1);
        assert_eq!(record.session, vec!["datestyle", "commit"]);
    }

    #[test]
    fn unknown_statement_is_programming_error() {
        let driver = MockDriver::new(2);
        let mut con = driver.connect().unwrap();
        let mut cursor = con.cursor(&CursorOptions::default()).unwrap();
        let err = cursor.execute("drop everything", &[]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Programming);
    }

    #[test]
    fn disconnect_invalidates_connections_and_cursors() {
        let driver = MockDriver::new(2);
        let mut con = driver.connect().unwrap();
        let mut cursor = con.cursor(&CursorOptions::default()).unwrap();
        driver.disconnect_all();

        assert_eq!(
            cursor.execute("select 1", &[]).unwrap_err().kind(),
            crate::ErrorKind::Internal
        );
        assert_eq!(con.ping().unwrap_err().kind(), crate::ErrorKind::Operational);
        assert_eq!(driver.open_connections(), 0);
    }

    #[test]
    fn failing_connects_then_recovering() {
        let driver = MockDriver::new(1);
        driver.fail_next_connects(2);
        assert!(driver.connect().is_err());
        assert!(driver.connect().is_err());
        assert!(driver.connect().is_ok());
        assert_eq!(driver.connects(), 1);
    }

    #[test]
    fn ping_unsupported() {
        let driver = MockDriver::new(2);
        driver.set_ping_supported(false);
        let mut con = driver.connect().unwrap();
        assert_eq!(con.ping().unwrap_err().kind(), crate::ErrorKind::NotSupported);
        let id = driver.last_connection_id().unwrap();
        assert_eq!(driver.record(id).unwrap().pings, 1);
    }

    #[test]
    fn size_hints_are_reported_once() {
        let driver = MockDriver::new(2);
        let mut con = driver.connect().unwrap();
        let mut cursor = con.cursor(&CursorOptions::default()).unwrap();
        cursor.setinputsizes(&[4, 8]).unwrap();
        cursor.setoutputsize(16, None).unwrap();
        cursor.setoutputsize(32, Some(2)).unwrap();
        cursor.execute("get sizes", &[]).unwrap();
        assert_eq!(
            cursor.fetchone().unwrap(),
            Some(vec![Value::from("[4, 8]"), Value::from("*:16,2:32")])
        );
        cursor.execute("get sizes", &[]).unwrap();
        assert_eq!(
            cursor.fetchone().unwrap(),
            Some(vec![Value::from("[]"), Value::from("")])
        );
    }

    #[test]
    fn close_twice_fails_at_driver_level() {
        let driver = MockDriver::new(2);
        let mut con = driver.connect().unwrap();
        con.close().unwrap();
        assert!(con.close().is_err());
        assert_eq!(driver.closes(), 1);
    }

    #[test]
    fn named_error_cursor_is_operational() {
        let driver = MockDriver::new(2);
        let mut con = driver.connect().unwrap();
        let err = con.cursor(&CursorOptions::named("error")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Operational);
    }

    #[test]
    fn begin_and_cancel_are_logged() {
        let driver = MockDriver::new(2);
        let mut con = driver.connect().unwrap();
        con.begin(&[]).unwrap();
        con.begin(&[Value::from("xid")]).unwrap();
        con.cancel().unwrap();
        let id = driver.last_connection_id().unwrap();
        assert_eq!(
            driver.record(id).unwrap().session,
            vec!["begin", "begin 'xid'", "cancel"]
        );
    }
}
