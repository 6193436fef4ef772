//! Shared in-memory fake driver for the behavioral test suites.
//!
//! Implements the driver seam over a tiny table store with just enough SQL
//! understanding for the scenarios: parameterized INSERT/DELETE, COUNT and
//! filtered SELECT, per-session isolation variables, `SELECT SLEEP(n)` with
//! delayed readiness for poll-loop tests, BEGIN-snapshot/ROLLBACK-restore
//! transaction semantics, and a kill switch to simulate dead connections.

#![allow(dead_code)]

use mysql_taskpool::config::{Config, OptionValue};
use mysql_taskpool::driver::{
    BindValue, Driver, DriverError, DriverFuture, RawCursor, RawRow, RawSession, RawStatement,
};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DEFAULT_ISOLATION: &str = "REPEATABLE-READ";

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> Config {
    Config::new("localhost", "root", "test")
}

type Tables = HashMap<String, Vec<RawRow>>;

#[derive(Default)]
struct FakeDbInner {
    tables: Tables,
    snapshots: HashMap<u64, Tables>,
    isolation: HashMap<u64, String>,
    applied_charsets: HashMap<u64, String>,
    applied_options: HashMap<u64, Vec<u32>>,
    pending_results: HashMap<u64, u32>,
    killed: HashSet<u64>,
    next_thread_id: u64,
    connect_count: u64,
    fail_connects: u32,
    fail_charsets: u32,
}

pub struct FakeDb {
    inner: Mutex<FakeDbInner>,
}

impl FakeDb {
    fn new() -> Self {
        Self {
            inner: Mutex::new(FakeDbInner::default()),
        }
    }

    fn check_alive(&self, thread_id: u64) -> Result<(), DriverError> {
        if self.inner.lock().unwrap().killed.contains(&thread_id) {
            Err(DriverError::with_code(2006, "MySQL server has gone away"))
        } else {
            Ok(())
        }
    }

    fn begin(&self, thread_id: u64) -> Result<(), DriverError> {
        self.check_alive(thread_id)?;
        let mut inner = self.inner.lock().unwrap();
        let snapshot = inner.tables.clone();
        inner.snapshots.insert(thread_id, snapshot);
        Ok(())
    }

    fn commit(&self, thread_id: u64) -> Result<(), DriverError> {
        self.check_alive(thread_id)?;
        self.inner.lock().unwrap().snapshots.remove(&thread_id);
        Ok(())
    }

    fn rollback(&self, thread_id: u64) -> Result<(), DriverError> {
        self.check_alive(thread_id)?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(snapshot) = inner.snapshots.remove(&thread_id) {
            inner.tables = snapshot;
        }
        Ok(())
    }

    fn run_sql(
        &self,
        thread_id: u64,
        sql: &str,
        values: &[BindValue],
    ) -> Result<Outcome, DriverError> {
        self.check_alive(thread_id)?;
        let mut inner = self.inner.lock().unwrap();
        let trimmed = sql.trim();
        let upper = trimmed.to_uppercase();

        if upper == "SELECT 1" {
            return Ok(Outcome::rows(&["1"], vec![row(&[("1", json!(1))])]));
        }

        if upper.starts_with("SELECT SLEEP(") {
            // The delay itself is modeled at submit time.
            return Ok(Outcome::rows(&["sleep"], vec![row(&[("sleep", json!(0))])]));
        }

        if upper.starts_with("SELECT @@TRANSACTION_ISOLATION") {
            let level = inner
                .isolation
                .get(&thread_id)
                .cloned()
                .unwrap_or_else(|| DEFAULT_ISOLATION.to_string());
            return Ok(Outcome::rows(
                &["@@transaction_isolation"],
                vec![row(&[("@@transaction_isolation", json!(level))])],
            ));
        }

        if let Some(level) = strip_prefix_ci(trimmed, "SET SESSION TRANSACTION ISOLATION LEVEL ") {
            let normalized = level.trim().to_uppercase().replace(' ', "-");
            inner.isolation.insert(thread_id, normalized);
            return Ok(Outcome::Affected(0));
        }

        if let Some(rest) = strip_prefix_ci(trimmed, "SELECT COUNT(*) FROM ") {
            let table = rest.split_whitespace().next().unwrap_or("").to_lowercase();
            let count = inner.tables.get(&table).map_or(0, Vec::len);
            return Ok(Outcome::rows(
                &["COUNT(*)"],
                vec![row(&[("COUNT(*)", json!(count))])],
            ));
        }

        if upper.starts_with("SELECT ") {
            return select(&inner, trimmed, &upper, values);
        }

        if let Some(rest) = strip_prefix_ci(trimmed, "INSERT INTO ") {
            return insert(&mut inner, rest, values);
        }

        if let Some(rest) = strip_prefix_ci(trimmed, "DELETE FROM ") {
            let table = rest.split_whitespace().next().unwrap_or("").to_lowercase();
            let removed = inner.tables.get_mut(&table).map_or(0, |rows| {
                let n = rows.len();
                rows.clear();
                n
            });
            return Ok(Outcome::Affected(removed as i64));
        }

        if upper.starts_with("CREATE TABLE") {
            let rest = trimmed["CREATE TABLE".len()..]
                .trim_start()
                .trim_start_matches("IF NOT EXISTS")
                .trim_start();
            let name = rest
                .split(|c: char| c == '(' || c.is_whitespace())
                .next()
                .unwrap_or("")
                .to_lowercase();
            inner.tables.entry(name).or_default();
            return Ok(Outcome::Affected(0));
        }

        Err(DriverError::with_code(1064, format!("fake engine cannot parse: {trimmed}")))
    }
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

fn row(pairs: &[(&str, Value)]) -> RawRow {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn bind_to_json(value: &BindValue) -> Value {
    match value {
        BindValue::Null => Value::Null,
        BindValue::Int(v) => json!(v),
        BindValue::Double(v) => json!(v),
        BindValue::Text(v) => json!(v),
        BindValue::Blob(v) => json!(String::from_utf8_lossy(v)),
    }
}

fn select(
    inner: &FakeDbInner,
    trimmed: &str,
    upper: &str,
    values: &[BindValue],
) -> Result<Outcome, DriverError> {
    let from_pos = upper
        .find(" FROM ")
        .ok_or_else(|| DriverError::with_code(1064, "SELECT without FROM"))?;
    let select_list = trimmed[7..from_pos].trim();
    let after_from = &trimmed[from_pos + " FROM ".len()..];
    let upper_after = &upper[from_pos + " FROM ".len()..];

    let (table, filter) = match upper_after.find(" WHERE ") {
        Some(where_pos) => {
            let table = after_from[..where_pos].trim();
            let clause = after_from[where_pos + " WHERE ".len()..].trim();
            let column = clause
                .split('=')
                .next()
                .map(str::trim)
                .ok_or_else(|| DriverError::with_code(1064, "unsupported WHERE clause"))?;
            let needle = values
                .first()
                .map(bind_to_json)
                .ok_or_else(|| DriverError::with_code(1064, "WHERE placeholder without value"))?;
            (table, Some((column.to_string(), needle)))
        }
        None => (after_from.split_whitespace().next().unwrap_or(""), None),
    };

    let rows_in: &[RawRow] = inner
        .tables
        .get(&table.to_lowercase())
        .map_or(&[], Vec::as_slice);
    let filtered: Vec<RawRow> = rows_in
        .iter()
        .filter(|r| {
            filter
                .as_ref()
                .is_none_or(|(col, needle)| r.get(col) == Some(needle))
        })
        .cloned()
        .collect();

    if select_list == "*" {
        let columns: Vec<String> = filtered
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        return Ok(Outcome::Rows {
            columns,
            rows: filtered,
        });
    }

    let columns: Vec<String> = select_list.split(',').map(|c| c.trim().to_string()).collect();
    let projected = filtered
        .into_iter()
        .map(|r| {
            columns
                .iter()
                .map(|c| (c.clone(), r.get(c).cloned().unwrap_or(Value::Null)))
                .collect()
        })
        .collect();
    Ok(Outcome::Rows {
        columns,
        rows: projected,
    })
}

fn insert(
    inner: &mut FakeDbInner,
    rest: &str,
    values: &[BindValue],
) -> Result<Outcome, DriverError> {
    let open = rest
        .find('(')
        .ok_or_else(|| DriverError::with_code(1064, "INSERT without column list"))?;
    let close = rest[open..]
        .find(')')
        .map(|p| p + open)
        .ok_or_else(|| DriverError::with_code(1064, "unterminated column list"))?;
    let table = rest[..open].trim().to_lowercase();
    let columns: Vec<String> = rest[open + 1..close]
        .split(',')
        .map(|c| c.trim().to_string())
        .collect();

    if columns.len() != values.len() {
        return Err(DriverError::with_code(
            1136,
            "column count doesn't match value count",
        ));
    }

    let new_row: RawRow = columns
        .iter()
        .zip(values)
        .map(|(c, v)| (c.clone(), bind_to_json(v)))
        .collect();
    inner.tables.entry(table).or_default().push(new_row);
    Ok(Outcome::Affected(1))
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Rows { columns: Vec<String>, rows: Vec<RawRow> },
    Affected(i64),
}

impl Outcome {
    fn rows(columns: &[&str], rows: Vec<RawRow>) -> Self {
        Self::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }
}

/// Test driver handle; clones share the same store.
#[derive(Clone)]
pub struct FakeDriver {
    db: Arc<FakeDb>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            db: Arc::new(FakeDb::new()),
        }
    }

    /// Mark a session's transport dead; every later operation on it fails.
    pub fn kill(&self, thread_id: u64) {
        self.db.inner.lock().unwrap().killed.insert(thread_id);
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.db.inner.lock().unwrap().fail_connects = n;
    }

    /// Make the next `n` charset applications fail (factory error path).
    pub fn fail_next_charsets(&self, n: u32) {
        self.db.inner.lock().unwrap().fail_charsets = n;
    }

    pub fn connect_count(&self) -> u64 {
        self.db.inner.lock().unwrap().connect_count
    }

    pub fn seed_table(&self, name: &str) {
        self.db
            .inner
            .lock()
            .unwrap()
            .tables
            .entry(name.to_lowercase())
            .or_default();
    }

    pub fn table_len(&self, name: &str) -> usize {
        self.db
            .inner
            .lock()
            .unwrap()
            .tables
            .get(&name.to_lowercase())
            .map_or(0, Vec::len)
    }

    /// Leave `n` undrained result sets on a session, as an aborted
    /// multi-result read would.
    pub fn set_pending_results(&self, thread_id: u64, n: u32) {
        self.db
            .inner
            .lock()
            .unwrap()
            .pending_results
            .insert(thread_id, n);
    }

    pub fn charset_of(&self, thread_id: u64) -> Option<String> {
        self.db
            .inner
            .lock()
            .unwrap()
            .applied_charsets
            .get(&thread_id)
            .cloned()
    }

    pub fn options_applied(&self, thread_id: u64) -> Vec<u32> {
        self.db
            .inner
            .lock()
            .unwrap()
            .applied_options
            .get(&thread_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for FakeDriver {
    type Session = FakeSession;

    fn connect<'a>(
        &'a self,
        config: &'a Config,
        _persistent: bool,
    ) -> DriverFuture<'a, Self::Session> {
        Box::pin(async move {
            let mut inner = self.db.inner.lock().unwrap();
            if inner.fail_connects > 0 {
                inner.fail_connects -= 1;
                return Err(DriverError::with_code(2002, "connection refused"));
            }
            if config.host.is_empty() {
                return Err(DriverError::with_code(2005, "unknown MySQL server host"));
            }
            inner.connect_count += 1;
            inner.next_thread_id += 1;
            let thread_id = inner.next_thread_id;
            drop(inner);
            Ok(FakeSession {
                db: self.db.clone(),
                thread_id,
                autocommit: true,
                in_tx: false,
                closed: false,
                pending: None,
                outcome: None,
            })
        })
    }
}

struct Pending {
    sql: String,
    ready_at: Instant,
}

pub struct FakeSession {
    db: Arc<FakeDb>,
    thread_id: u64,
    autocommit: bool,
    in_tx: bool,
    closed: bool,
    pending: Option<Pending>,
    outcome: Option<Outcome>,
}

fn parse_sleep(sql: &str) -> Option<Duration> {
    let upper = sql.trim().to_uppercase();
    let rest = upper.strip_prefix("SELECT SLEEP(")?;
    let close = rest.find(')')?;
    let seconds: f64 = rest[..close].parse().ok()?;
    Some(Duration::from_secs_f64(seconds))
}

impl RawSession for FakeSession {
    type Statement = FakeStatement;
    type Cursor = FakeCursor;

    fn thread_id(&self) -> u64 {
        self.thread_id
    }

    fn connected(&self) -> bool {
        !self.closed && self.db.check_alive(self.thread_id).is_ok()
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    fn set_option(&mut self, code: u32, _value: &OptionValue) -> Result<(), DriverError> {
        self.db
            .inner
            .lock()
            .unwrap()
            .applied_options
            .entry(self.thread_id)
            .or_default()
            .push(code);
        Ok(())
    }

    fn set_charset<'a>(&'a mut self, charset: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.db.inner.lock().unwrap();
            if inner.fail_charsets > 0 {
                inner.fail_charsets -= 1;
                return Err(DriverError::with_code(2019, "unknown character set"));
            }
            inner
                .applied_charsets
                .insert(self.thread_id, charset.to_string());
            Ok(())
        })
    }

    fn query<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move { self.db.run_sql(self.thread_id, sql, &[]).map(|_| ()) })
    }

    fn submit(&mut self, sql: &str) -> Result<(), DriverError> {
        self.db.check_alive(self.thread_id)?;
        let delay = parse_sleep(sql).unwrap_or(Duration::ZERO);
        self.pending = Some(Pending {
            sql: sql.to_string(),
            ready_at: Instant::now() + delay,
        });
        Ok(())
    }

    fn poll_ready(&mut self, _timeout: Duration) -> Result<bool, DriverError> {
        self.db.check_alive(self.thread_id)?;
        match &self.pending {
            // Returning early instead of sleeping keeps the scheduler free to
            // interleave other tasks.
            Some(pending) => Ok(Instant::now() >= pending.ready_at),
            None => Err(DriverError::new("no statement in flight")),
        }
    }

    fn reap(&mut self) -> Result<(), DriverError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| DriverError::new("nothing to reap"))?;
        let outcome = self.db.run_sql(self.thread_id, &pending.sql, &[])?;
        self.outcome = Some(outcome);
        Ok(())
    }

    fn prepare<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, Self::Statement> {
        Box::pin(async move {
            self.db.check_alive(self.thread_id)?;
            Ok(FakeStatement {
                db: self.db.clone(),
                thread_id: self.thread_id,
                sql: sql.to_string(),
                values: Vec::new(),
                outcome: None,
            })
        })
    }

    fn take_cursor(&mut self) -> Result<Self::Cursor, DriverError> {
        match self.outcome.take() {
            Some(Outcome::Rows { columns, rows }) => Ok(FakeCursor {
                columns,
                rows: rows.into_iter(),
            }),
            _ => Err(DriverError::new("no result set available")),
        }
    }

    fn affected_rows(&self) -> i64 {
        match &self.outcome {
            Some(Outcome::Affected(n)) => *n,
            _ => -1,
        }
    }

    fn begin<'a>(&'a mut self) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.db.begin(self.thread_id)?;
            self.in_tx = true;
            Ok(())
        })
    }

    fn commit<'a>(&'a mut self) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.db.commit(self.thread_id)?;
            self.in_tx = false;
            Ok(())
        })
    }

    fn rollback<'a>(&'a mut self) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.db.rollback(self.thread_id)?;
            self.in_tx = false;
            Ok(())
        })
    }

    fn set_autocommit<'a>(&'a mut self, enabled: bool) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.db.check_alive(self.thread_id)?;
            self.autocommit = enabled;
            Ok(())
        })
    }

    fn more_results(&self) -> bool {
        self.db
            .inner
            .lock()
            .unwrap()
            .pending_results
            .get(&self.thread_id)
            .copied()
            .unwrap_or(0)
            > 0
    }

    fn next_result(&mut self) -> Result<(), DriverError> {
        self.db.check_alive(self.thread_id)?;
        let mut inner = self.db.inner.lock().unwrap();
        if let Some(count) = inner.pending_results.get_mut(&self.thread_id) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    fn close<'a>(&'a mut self) -> futures_util::future::BoxFuture<'a, ()> {
        Box::pin(async move {
            self.closed = true;
            let mut inner = self.db.inner.lock().unwrap();
            inner.snapshots.remove(&self.thread_id);
            inner.pending_results.remove(&self.thread_id);
        })
    }
}

pub struct FakeStatement {
    db: Arc<FakeDb>,
    thread_id: u64,
    sql: String,
    values: Vec<BindValue>,
    outcome: Option<Outcome>,
}

impl RawStatement for FakeStatement {
    type Cursor = FakeCursor;

    fn bind(&mut self, types: &str, values: &[BindValue]) -> Result<(), DriverError> {
        if types.len() != values.len() {
            return Err(DriverError::with_code(
                2031,
                "type string length does not match parameter count",
            ));
        }
        self.values = values.to_vec();
        Ok(())
    }

    fn execute<'a>(&'a mut self) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let outcome = self.db.run_sql(self.thread_id, &self.sql, &self.values)?;
            self.outcome = Some(outcome);
            Ok(())
        })
    }

    fn take_cursor(&mut self) -> Result<Self::Cursor, DriverError> {
        match self.outcome.take() {
            Some(Outcome::Rows { columns, rows }) => Ok(FakeCursor {
                columns,
                rows: rows.into_iter(),
            }),
            _ => Err(DriverError::new("no result set available")),
        }
    }

    fn affected_rows(&self) -> i64 {
        match &self.outcome {
            Some(Outcome::Affected(n)) => *n,
            _ => -1,
        }
    }
}

pub struct FakeCursor {
    columns: Vec<String>,
    rows: std::vec::IntoIter<RawRow>,
}

impl RawCursor for FakeCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<RawRow>, DriverError> {
        Ok(self.rows.next())
    }
}
