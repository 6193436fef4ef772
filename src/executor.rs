//! Query execution engine.
//!
//! Parameterized statements run through the prepared-statement cycle
//! (prepare, bind, execute), with each stage's failure tagged so callers can
//! tell where a query died. Parameterless statements go through the client
//! library's asynchronous submit entry point and are driven to completion by
//! an adaptive poll loop that yields to the scheduler between readiness
//! checks, which is what lets other tasks run while a query is in flight.

use crate::driver::{RawCursor, RawSession, RawStatement};
use crate::error::{Error, QueryStage, Result};
use crate::params::{Param, detect_types, preprocess};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::task::yield_now;
use tracing::debug;

/// Initial poll-loop readiness timeout.
pub const POLL_MIN: Duration = Duration::from_micros(10);

/// Poll-loop readiness timeout ceiling.
pub const POLL_MAX: Duration = Duration::from_micros(100);

/// Growth factor applied to the poll interval after each miss.
const POLL_GROWTH: f64 = 1.2;

/// One result row: column name to value.
pub type Row = serde_json::Map<String, JsonValue>;

/// The post-execution projection a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchShape {
    /// Every row, in cursor order.
    Rows,
    /// The first row, if any.
    Row,
    /// The first column of the first row, or null.
    Value,
    /// The affected-row count, clamped to zero.
    Affected,
}

/// A shaped query result.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Rows(Vec<Row>),
    Row(Option<Row>),
    Value(JsonValue),
    Affected(u64),
}

impl QueryOutput {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::Row(row) => row.into_iter().collect(),
            Self::Value(_) | Self::Affected(_) => Vec::new(),
        }
    }

    pub fn into_row(self) -> Option<Row> {
        match self {
            Self::Rows(rows) => rows.into_iter().next(),
            Self::Row(row) => row,
            Self::Value(_) | Self::Affected(_) => None,
        }
    }

    pub fn into_value(self) -> JsonValue {
        match self {
            Self::Value(value) => value,
            Self::Affected(n) => JsonValue::from(n),
            Self::Rows(_) | Self::Row(_) => JsonValue::Null,
        }
    }

    pub fn into_affected(self) -> u64 {
        match self {
            Self::Affected(n) => n,
            Self::Rows(rows) => rows.len() as u64,
            Self::Row(_) | Self::Value(_) => 0,
        }
    }
}

/// Drives statements on a borrowed session and shapes their results.
#[derive(Debug, Clone, Copy)]
pub struct QueryExecutor {
    poll_min: Duration,
    poll_max: Duration,
}

impl QueryExecutor {
    pub fn new() -> Self {
        Self {
            poll_min: POLL_MIN,
            poll_max: POLL_MAX,
        }
    }

    /// Override the poll-loop window. Useful for latency tuning; the defaults
    /// suit sub-millisecond queries.
    pub fn with_poll_window(poll_min: Duration, poll_max: Duration) -> Self {
        Self { poll_min, poll_max }
    }

    /// Execute `sql` on `session` and shape the result.
    ///
    /// `types` overrides the derived mysql type string when given; otherwise
    /// it is computed from the parameter values.
    pub async fn execute<S: RawSession>(
        &self,
        session: &mut S,
        sql: &str,
        params: &[Param],
        types: Option<&str>,
        shape: FetchShape,
    ) -> Result<QueryOutput> {
        debug!(
            sql = %sql,
            params = params.len(),
            shape = ?shape,
            thread_id = session.thread_id(),
            "executing query"
        );

        if params.is_empty() {
            self.execute_submitted(session, sql, shape).await
        } else {
            self.execute_prepared(session, sql, params, types, shape)
                .await
        }
    }

    async fn execute_prepared<S: RawSession>(
        &self,
        session: &mut S,
        sql: &str,
        params: &[Param],
        types: Option<&str>,
        shape: FetchShape,
    ) -> Result<QueryOutput> {
        let mut statement = session
            .prepare(sql)
            .await
            .map_err(|e| Error::query(QueryStage::Prepare, sql, params, e))?;

        let types = match types {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => detect_types(params),
        };
        let values = preprocess(params);

        statement
            .bind(&types, &values)
            .map_err(|e| Error::query(QueryStage::Bind, sql, params, e))?;

        statement
            .execute()
            .await
            .map_err(|e| Error::query(QueryStage::Execute, sql, params, e))?;

        if produces_result_set(sql) {
            let cursor = statement
                .take_cursor()
                .map_err(|e| Error::query(QueryStage::Unexpected, sql, params, e))?;
            shape_cursor(cursor, shape, sql, params)
        } else {
            Ok(shape_affected(statement.affected_rows(), shape))
        }
    }

    async fn execute_submitted<S: RawSession>(
        &self,
        session: &mut S,
        sql: &str,
        shape: FetchShape,
    ) -> Result<QueryOutput> {
        session
            .submit(sql)
            .map_err(|e| Error::query(QueryStage::Execute, sql, &[], e))?;

        self.await_ready(session, sql).await?;

        session
            .reap()
            .map_err(|e| Error::query(QueryStage::Reap, sql, &[], e))?;

        if produces_result_set(sql) {
            let cursor = session
                .take_cursor()
                .map_err(|e| Error::query(QueryStage::Unexpected, sql, &[], e))?;
            shape_cursor(cursor, shape, sql, &[])
        } else {
            Ok(shape_affected(session.affected_rows(), shape))
        }
    }

    /// The poll loop. A zero-timeout check catches queries that completed
    /// inside the driver before we got here; after that the readiness timeout
    /// grows geometrically up to the ceiling, with one scheduler yield per
    /// miss so concurrent tasks interleave.
    async fn await_ready<S: RawSession>(&self, session: &mut S, sql: &str) -> Result<()> {
        let ready = session
            .poll_ready(Duration::ZERO)
            .map_err(|e| Error::query(QueryStage::Poll, sql, &[], e))?;
        if ready {
            return Ok(());
        }

        let mut interval = self.poll_min;
        loop {
            let ready = session
                .poll_ready(interval)
                .map_err(|e| Error::query(QueryStage::Poll, sql, &[], e))?;
            if ready {
                return Ok(());
            }
            yield_now().await;
            interval = next_interval(interval, self.poll_max);
        }
    }
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn next_interval(current: Duration, ceiling: Duration) -> Duration {
    current.mul_f64(POLL_GROWTH).min(ceiling)
}

/// Whether the first keyword of `sql` announces a result set.
fn produces_result_set(sql: &str) -> bool {
    let keyword = sql.trim_start().split_whitespace().next().unwrap_or("");
    keyword.eq_ignore_ascii_case("SELECT")
        || keyword.eq_ignore_ascii_case("SHOW")
        || keyword.eq_ignore_ascii_case("DESCRIBE")
}

fn shape_affected(affected: i64, shape: FetchShape) -> QueryOutput {
    let count = affected.max(0) as u64;
    match shape {
        FetchShape::Rows => QueryOutput::Rows(Vec::new()),
        FetchShape::Row => QueryOutput::Row(None),
        FetchShape::Value => QueryOutput::Value(JsonValue::Null),
        FetchShape::Affected => QueryOutput::Affected(count),
    }
}

fn shape_cursor<C: RawCursor>(
    mut cursor: C,
    shape: FetchShape,
    sql: &str,
    params: &[Param],
) -> Result<QueryOutput> {
    let unexpected = |e| Error::query(QueryStage::Unexpected, sql, params, e);

    match shape {
        FetchShape::Rows => {
            let mut rows = Vec::new();
            while let Some(row) = cursor.next_row().map_err(unexpected)? {
                rows.push(row);
            }
            Ok(QueryOutput::Rows(rows))
        }
        FetchShape::Row => Ok(QueryOutput::Row(cursor.next_row().map_err(unexpected)?)),
        FetchShape::Value => {
            let first_column = cursor.columns().first().cloned();
            let value = match cursor.next_row().map_err(unexpected)? {
                Some(row) => first_column
                    .and_then(|column| row.get(&column).cloned())
                    .unwrap_or(JsonValue::Null),
                None => JsonValue::Null,
            };
            Ok(QueryOutput::Value(value))
        }
        FetchShape::Affected => {
            let mut count = 0_u64;
            while cursor.next_row().map_err(unexpected)?.is_some() {
                count += 1;
            }
            Ok(QueryOutput::Affected(count))
        }
    }
}
