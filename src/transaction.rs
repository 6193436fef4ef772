//! Transaction orchestration.
//!
//! The runner owns the whole per-attempt cycle: borrow a session, set the
//! requested isolation level, open the transaction, hand the user callback a
//! [`Transaction`] facade bound to that session, then commit or roll back,
//! fire the registered hooks, and give the session back. A failed attempt is
//! recorded and the cycle repeats until the attempt budget runs out, at which
//! point the caller gets [`Error::TransactionFailed`] carrying the full
//! attempt history.

use crate::driver::{Driver, RawSession};
use crate::error::{BoxError, Error, Result, TxStage};
use crate::executor::{FetchShape, QueryExecutor, QueryOutput, Row};
use crate::params::Param;
use crate::pool::{Pool, PooledSession, SessionId};
use crate::registry::{self, Hook, TransactionRegistry};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// MySQL transaction isolation level, emitted verbatim after
/// `SET SESSION TRANSACTION ISOLATION LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

/// Options for one transaction invocation.
#[derive(Debug, Clone, Copy)]
pub struct TxOptions {
    /// Total attempt budget, including the first run. Must be at least 1.
    pub attempts: u32,
    /// Session isolation level to set before BEGIN. The level sticks to the
    /// session afterwards; unset means the session keeps whatever it has
    /// (the server default on a fresh session).
    pub isolation: Option<IsolationLevel>,
}

impl TxOptions {
    pub fn new() -> Self {
        Self {
            attempts: 1,
            isolation: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }
}

impl Default for TxOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// One failed attempt, as recorded in [`Error::TransactionFailed`].
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub error: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// What a user callback sees: the four query shapes bound to the
/// transaction's session, hook registration, and raw session access.
pub struct Transaction<S: RawSession> {
    session: PooledSession<S>,
    registry: Arc<TransactionRegistry>,
    executor: QueryExecutor,
}

impl<S: RawSession> Transaction<S> {
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// All rows.
    pub async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Row>> {
        self.shaped(sql, params, None, FetchShape::Rows)
            .await
            .map(QueryOutput::into_rows)
    }

    /// First row, if any.
    pub async fn fetch_one(&mut self, sql: &str, params: &[Param]) -> Result<Option<Row>> {
        self.shaped(sql, params, None, FetchShape::Row)
            .await
            .map(QueryOutput::into_row)
    }

    /// First column of the first row, or null.
    pub async fn fetch_value(&mut self, sql: &str, params: &[Param]) -> Result<JsonValue> {
        self.shaped(sql, params, None, FetchShape::Value)
            .await
            .map(QueryOutput::into_value)
    }

    /// Affected-row count.
    pub async fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64> {
        self.shaped(sql, params, None, FetchShape::Affected)
            .await
            .map(QueryOutput::into_affected)
    }

    /// General form: explicit type string and result shape.
    pub async fn shaped(
        &mut self,
        sql: &str,
        params: &[Param],
        types: Option<&str>,
        shape: FetchShape,
    ) -> Result<QueryOutput> {
        let executor = self.executor;
        executor
            .execute(self.session.raw_mut(), sql, params, types, shape)
            .await
    }

    /// Register a hook to run after a successful COMMIT, in registration
    /// order.
    pub fn on_commit<H>(&self, hook: H) -> Result<()>
    where
        H: FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    {
        self.registry.on_commit(self.session.id(), Box::new(hook))
    }

    /// Register a hook to run after ROLLBACK, in registration order.
    pub fn on_rollback<H>(&self, hook: H) -> Result<()>
    where
        H: FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    {
        self.registry.on_rollback(self.session.id(), Box::new(hook))
    }

    /// The underlying pooled session, for operations the facade does not
    /// cover. The session stays bound to the transaction.
    pub fn raw_session(&mut self) -> &mut PooledSession<S> {
        &mut self.session
    }

    fn into_session(self) -> PooledSession<S> {
        self.session
    }
}

/// Run `callback` inside a transaction, retrying the whole cycle on failure.
pub(crate) async fn run_transaction<D, T, F>(
    pool: &Pool<D>,
    executor: QueryExecutor,
    registry: &Arc<TransactionRegistry>,
    options: TxOptions,
    mut callback: F,
) -> Result<T>
where
    D: Driver,
    F: for<'t> FnMut(
        &'t mut Transaction<D::Session>,
    ) -> BoxFuture<'t, std::result::Result<T, BoxError>>,
{
    if options.attempts == 0 {
        return Err(Error::invalid_argument("attempts"));
    }

    let mut history = Vec::new();
    for attempt in 1..=options.attempts {
        let started_at = Utc::now();
        let clock = Instant::now();

        match run_attempt(pool, executor, registry, options.isolation, &mut callback).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "transaction succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                warn!(attempt, total = options.attempts, error = %error, "transaction attempt failed");
                history.push(AttemptRecord {
                    attempt,
                    error: error.to_string(),
                    started_at,
                    elapsed: clock.elapsed(),
                });
                if attempt == options.attempts {
                    return Err(Error::TransactionFailed {
                        attempts: options.attempts,
                        history,
                        source: error,
                    });
                }
            }
        }
    }
    unreachable!("attempt loop always returns")
}

async fn run_attempt<D, T, F>(
    pool: &Pool<D>,
    executor: QueryExecutor,
    registry: &Arc<TransactionRegistry>,
    isolation: Option<IsolationLevel>,
    callback: &mut F,
) -> std::result::Result<T, BoxError>
where
    D: Driver,
    F: for<'t> FnMut(
        &'t mut Transaction<D::Session>,
    ) -> BoxFuture<'t, std::result::Result<T, BoxError>>,
{
    let session = pool.acquire().await.map_err(BoxError::from)?;
    let (session, outcome) = drive_attempt(session, executor, registry, isolation, callback).await;
    pool.release(session).await;
    outcome
}

/// The body of one attempt. Always returns the session so the caller can
/// release it on every path.
async fn drive_attempt<S, T, F>(
    mut session: PooledSession<S>,
    executor: QueryExecutor,
    registry: &Arc<TransactionRegistry>,
    isolation: Option<IsolationLevel>,
    callback: &mut F,
) -> (PooledSession<S>, std::result::Result<T, BoxError>)
where
    S: RawSession,
    F: for<'t> FnMut(&'t mut Transaction<S>) -> BoxFuture<'t, std::result::Result<T, BoxError>>,
{
    let session_id = session.id();

    if let Some(level) = isolation {
        let sql = format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql());
        if let Err(error) = session.raw_mut().query(&sql).await {
            return (
                session,
                Err(Error::transaction(TxStage::Isolation, error).into()),
            );
        }
    }

    if let Err(error) = session.raw_mut().set_autocommit(false).await {
        return (session, Err(Error::transaction(TxStage::Begin, error).into()));
    }
    if let Err(error) = session.raw_mut().begin().await {
        return (session, Err(Error::transaction(TxStage::Begin, error).into()));
    }

    if let Err(error) = registry.attach(session_id) {
        let _ = session.raw_mut().rollback().await;
        let _ = session.raw_mut().set_autocommit(true).await;
        return (session, Err(error.into()));
    }

    debug!(session_id = %session_id, isolation = ?isolation, "transaction begun");

    let mut tx = Transaction {
        session,
        registry: registry.clone(),
        executor,
    };
    let callback_result = registry::scope_current(session_id, callback(&mut tx)).await;
    let mut session = tx.into_session();

    match callback_result {
        Ok(value) => {
            if let Err(error) = session.raw_mut().commit().await {
                registry.detach(session_id);
                let _ = session.raw_mut().rollback().await;
                let _ = session.raw_mut().set_autocommit(true).await;
                return (
                    session,
                    Err(Error::transaction(TxStage::Commit, error).into()),
                );
            }
            if let Err(error) = session.raw_mut().set_autocommit(true).await {
                warn!(session_id = %session_id, error = %error, "failed to restore autocommit after commit");
            }
            info!(session_id = %session_id, "transaction committed");

            let hooks = registry.detach(session_id);
            if let Some(first_error) = fire_hooks(hooks.map(|h| h.commit), session_id, "commit") {
                // The data is committed; only the hook phase failed.
                return (
                    session,
                    Err(Error::transaction(TxStage::CommitHook, first_error).into()),
                );
            }
            (session, Ok(value))
        }
        Err(original) => {
            if let Err(error) = session.raw_mut().rollback().await {
                warn!(session_id = %session_id, error = %error, "rollback failed");
            }
            if let Err(error) = session.raw_mut().set_autocommit(true).await {
                warn!(session_id = %session_id, error = %error, "failed to restore autocommit after rollback");
            }
            info!(session_id = %session_id, "transaction rolled back");

            let hooks = registry.detach(session_id);
            let original = match fire_hooks(hooks.map(|h| h.rollback), session_id, "rollback") {
                // The hook failure never displaces the error that caused the
                // rollback; it stays reachable underneath it.
                Some(hook_error) => Box::new(RollbackHookFailed {
                    cause: original,
                    hook_error: Error::transaction(TxStage::RollbackHook, hook_error),
                }) as BoxError,
                None => original,
            };
            (session, Err(original))
        }
    }
}

/// The re-raised rollback cause, with the first failed rollback hook chained
/// underneath it as the source.
#[derive(Debug, thiserror::Error)]
#[error("{cause}")]
struct RollbackHookFailed {
    cause: BoxError,
    #[source]
    hook_error: Error,
}

/// Fire hooks in registration order. Every hook runs even after one fails;
/// the first failure is returned.
fn fire_hooks(hooks: Option<Vec<Hook>>, session_id: SessionId, phase: &str) -> Option<BoxError> {
    let hooks = hooks?;
    let mut first_error = None;
    for hook in hooks {
        if let Err(error) = hook() {
            warn!(session_id = %session_id, phase, error = %error, "after-hook failed");
            if first_error.is_none() {
                first_error = Some(error);
            }
        }
    }
    first_error
}
