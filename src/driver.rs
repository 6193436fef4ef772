//! The seam to the host-provided MySQL client library.
//!
//! The crate does not speak the wire protocol itself. Everything it needs
//! from the client library is captured by the trait family below: a
//! [`Driver`] hands out raw sessions, a [`RawSession`] exposes the
//! per-connection operations (simple queries, asynchronous submit with
//! poll/reap completion, transaction control, multi-result draining), a
//! [`RawStatement`] covers the prepared-statement cycle, and a [`RawCursor`]
//! walks one result set.
//!
//! Async operations return a boxed [`DriverFuture`] so implementations stay
//! free to borrow from themselves without higher-kinded gymnastics.

use crate::config::{Config, OptionValue};
use futures_util::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

/// Future type returned by async driver operations.
pub type DriverFuture<'a, T> = BoxFuture<'a, Result<T, DriverError>>;

/// One row as produced by a cursor: column name to JSON value, in select-list
/// order where the implementation preserves it (use [`RawCursor::columns`]
/// for positional access).
pub type RawRow = serde_json::Map<String, serde_json::Value>;

/// Error reported by the client library.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    /// Server error code, when one was received.
    pub code: Option<u32>,
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

/// A parameter value in the form the client library binds it.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Int(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Session factory: the entry point the host client library provides.
pub trait Driver: Send + Sync + 'static {
    type Session: RawSession;

    /// Perform the handshake described by `config`. `persistent` selects the
    /// driver's process-wide reusable-handle facility when it has one; the
    /// returned session behaves identically either way.
    fn connect<'a>(&'a self, config: &'a Config, persistent: bool)
    -> DriverFuture<'a, Self::Session>;
}

/// One MySQL connection as the client library exposes it.
pub trait RawSession: Send + 'static {
    type Statement: RawStatement<Cursor = Self::Cursor>;
    type Cursor: RawCursor;

    /// Server-side connection thread id.
    fn thread_id(&self) -> u64;

    /// Transport-level liveness as last observed by the driver.
    fn connected(&self) -> bool;

    /// Whether an explicit transaction is open on this session.
    fn in_transaction(&self) -> bool;

    fn autocommit(&self) -> bool;

    /// Apply one driver option. Only valid before the session is used.
    fn set_option(&mut self, code: u32, value: &OptionValue) -> Result<(), DriverError>;

    fn set_charset<'a>(&'a mut self, charset: &'a str) -> DriverFuture<'a, ()>;

    /// Simple round-trip query; any produced result set is discarded.
    fn query<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, ()>;

    /// Submit `sql` without waiting for completion. Completion is observed
    /// through [`poll_ready`](Self::poll_ready) and claimed with
    /// [`reap`](Self::reap).
    fn submit(&mut self, sql: &str) -> Result<(), DriverError>;

    /// Readiness check bounded by `timeout`. `Ok(true)` once a submitted
    /// statement's outcome can be reaped. Implementations may return earlier
    /// than `timeout`; they must not block past it.
    fn poll_ready(&mut self, timeout: Duration) -> Result<bool, DriverError>;

    /// Claim the outcome of the submitted statement, making its result set
    /// (if any) available through [`take_cursor`](Self::take_cursor).
    fn reap(&mut self) -> Result<(), DriverError>;

    fn prepare<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, Self::Statement>;

    /// Cursor over the current result set. Errors when the last statement
    /// produced none.
    fn take_cursor(&mut self) -> Result<Self::Cursor, DriverError>;

    /// Rows affected by the last data-modifying statement. Drivers report -1
    /// for statements without a row count.
    fn affected_rows(&self) -> i64;

    fn begin<'a>(&'a mut self) -> DriverFuture<'a, ()>;

    fn commit<'a>(&'a mut self) -> DriverFuture<'a, ()>;

    fn rollback<'a>(&'a mut self) -> DriverFuture<'a, ()>;

    fn set_autocommit<'a>(&'a mut self, enabled: bool) -> DriverFuture<'a, ()>;

    /// True while undrained extra result sets remain on the wire.
    fn more_results(&self) -> bool;

    /// Advance past the current pending result set.
    fn next_result(&mut self) -> Result<(), DriverError>;

    /// Tear the connection down. Never fails; the session is unusable after.
    fn close<'a>(&'a mut self) -> BoxFuture<'a, ()>;
}

/// A prepared statement bound to the session that produced it.
pub trait RawStatement: Send + 'static {
    type Cursor: RawCursor;

    /// Bind parameters using a mysql type string (`i`/`d`/`s`/`b`, one
    /// character per value).
    fn bind(&mut self, types: &str, values: &[BindValue]) -> Result<(), DriverError>;

    fn execute<'a>(&'a mut self) -> DriverFuture<'a, ()>;

    /// Cursor over the statement's result set. Errors when it produced none.
    fn take_cursor(&mut self) -> Result<Self::Cursor, DriverError>;

    fn affected_rows(&self) -> i64;
}

/// Forward-only cursor over a single result set.
pub trait RawCursor: Send + 'static {
    /// Column names in select-list order.
    fn columns(&self) -> &[String];

    fn next_row(&mut self) -> Result<Option<RawRow>, DriverError>;
}
