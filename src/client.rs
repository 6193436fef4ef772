//! Client facade.
//!
//! [`Client`] stitches the pool, the executor, and the transaction runner
//! into one surface: each one-shot query borrows a session, runs, and gives
//! the session back on every exit path. [`SharedClient`] adds init-once
//! semantics on top for applications that want a single process-wide handle
//! without a global.

use crate::config::Config;
use crate::driver::Driver;
use crate::error::{BoxError, Error, Result};
use crate::executor::{FetchShape, QueryExecutor, QueryOutput, Row};
use crate::params::Param;
use crate::pool::{Pool, PoolStats, PooledSession, SessionId};
use crate::registry::TransactionRegistry;
use crate::transaction::{self, Transaction, TxOptions};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

/// Asynchronous MySQL client over one bounded session pool.
///
/// Cheap to clone; clones share the pool and transaction registry.
pub struct Client<D: Driver> {
    pool: Pool<D>,
    executor: QueryExecutor,
    registry: Arc<TransactionRegistry>,
}

impl<D: Driver> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            executor: self.executor,
            registry: self.registry.clone(),
        }
    }
}

impl<D: Driver> Client<D> {
    /// Create a client with up to `capacity` concurrent sessions.
    pub fn new(driver: D, config: Config, capacity: usize) -> Result<Self> {
        Ok(Self {
            pool: Pool::new(driver, config, capacity)?,
            executor: QueryExecutor::new(),
            registry: Arc::new(TransactionRegistry::new()),
        })
    }

    /// Replace the default executor, e.g. to tune the poll window.
    pub fn with_executor(mut self, executor: QueryExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// All rows.
    pub async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>> {
        self.shaped(sql, params, None, FetchShape::Rows)
            .await
            .map(QueryOutput::into_rows)
    }

    /// First row, if any.
    pub async fn fetch_one(&self, sql: &str, params: &[Param]) -> Result<Option<Row>> {
        self.shaped(sql, params, None, FetchShape::Row)
            .await
            .map(QueryOutput::into_row)
    }

    /// First column of the first row, or null.
    pub async fn fetch_value(&self, sql: &str, params: &[Param]) -> Result<JsonValue> {
        self.shaped(sql, params, None, FetchShape::Value)
            .await
            .map(QueryOutput::into_value)
    }

    /// Affected-row count.
    pub async fn execute(&self, sql: &str, params: &[Param]) -> Result<u64> {
        self.shaped(sql, params, None, FetchShape::Affected)
            .await
            .map(QueryOutput::into_affected)
    }

    /// General form: explicit type string and result shape.
    pub async fn shaped(
        &self,
        sql: &str,
        params: &[Param],
        types: Option<&str>,
        shape: FetchShape,
    ) -> Result<QueryOutput> {
        let mut session = self.pool.acquire().await?;
        let result = self
            .executor
            .execute(session.raw_mut(), sql, params, types, shape)
            .await;
        self.pool.release(session).await;
        result
    }

    /// Borrow a session for the duration of `body`. The session is released
    /// whether `body` succeeds or fails.
    pub async fn run<T, F>(&self, body: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut PooledSession<D::Session>) -> BoxFuture<'s, Result<T>>,
    {
        let mut session = self.pool.acquire().await?;
        let result = body(&mut session).await;
        self.pool.release(session).await;
        result
    }

    /// Run `callback` inside a transaction per `options`, retrying the whole
    /// acquire-begin-commit cycle on failure.
    pub async fn transaction<T, F>(&self, options: TxOptions, callback: F) -> Result<T>
    where
        F: for<'t> FnMut(
            &'t mut Transaction<D::Session>,
        ) -> BoxFuture<'t, std::result::Result<T, BoxError>>,
    {
        transaction::run_transaction(&self.pool, self.executor, &self.registry, options, callback)
            .await
    }

    /// Register a commit hook on the calling task's current transaction.
    ///
    /// Errors with [`Error::NotInTransaction`] outside a transaction callback.
    pub fn on_commit<H>(&self, hook: H) -> Result<()>
    where
        H: FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    {
        self.registry.on_commit_current(Box::new(hook))
    }

    /// Register a rollback hook on the calling task's current transaction.
    pub fn on_rollback<H>(&self, hook: H) -> Result<()>
    where
        H: FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    {
        self.registry.on_rollback_current(Box::new(hook))
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn last_handed_out(&self) -> Option<SessionId> {
        self.pool.last_handed_out()
    }

    /// The configuration the pool was built from.
    pub fn config(&self) -> &Config {
        self.pool.config()
    }

    /// Close the underlying pool. Pending waiters are rejected.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Init-once wrapper over one [`Client`].
///
/// `init` builds the client on first call and silently ignores later calls;
/// every other operation fails with [`Error::NotInitialized`] until then.
/// `reset` closes and clears the held client so `init` works again.
pub struct SharedClient<D: Driver> {
    slot: Arc<RwLock<Option<Client<D>>>>,
}

impl<D: Driver> Clone for SharedClient<D> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<D: Driver> SharedClient<D> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
        }
    }

    /// Build the wrapped client. A second call is a no-op.
    pub fn init(&self, driver: D, config: Config, capacity: usize) -> Result<()> {
        let mut slot = self.slot.write();
        if slot.is_some() {
            debug!("client already initialized; init ignored");
            return Ok(());
        }
        *slot = Some(Client::new(driver, config, capacity)?);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Close and clear the wrapped client.
    pub async fn reset(&self) {
        let client = self.slot.write().take();
        if let Some(client) = client {
            client.close().await;
        }
    }

    fn client(&self) -> Result<Client<D>> {
        self.slot.read().clone().ok_or(Error::NotInitialized)
    }

    pub async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>> {
        self.client()?.query(sql, params).await
    }

    pub async fn fetch_one(&self, sql: &str, params: &[Param]) -> Result<Option<Row>> {
        self.client()?.fetch_one(sql, params).await
    }

    pub async fn fetch_value(&self, sql: &str, params: &[Param]) -> Result<JsonValue> {
        self.client()?.fetch_value(sql, params).await
    }

    pub async fn execute(&self, sql: &str, params: &[Param]) -> Result<u64> {
        self.client()?.execute(sql, params).await
    }

    pub async fn run<T, F>(&self, body: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut PooledSession<D::Session>) -> BoxFuture<'s, Result<T>>,
    {
        self.client()?.run(body).await
    }

    pub async fn transaction<T, F>(&self, options: TxOptions, callback: F) -> Result<T>
    where
        F: for<'t> FnMut(
            &'t mut Transaction<D::Session>,
        ) -> BoxFuture<'t, std::result::Result<T, BoxError>>,
    {
        self.client()?.transaction(options, callback).await
    }

    pub fn on_commit<H>(&self, hook: H) -> Result<()>
    where
        H: FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    {
        self.client()?.on_commit(hook)
    }

    pub fn on_rollback<H>(&self, hook: H) -> Result<()>
    where
        H: FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    {
        self.client()?.on_rollback(hook)
    }

    pub fn stats(&self) -> Result<PoolStats> {
        Ok(self.client()?.stats())
    }

    pub fn last_handed_out(&self) -> Result<Option<SessionId>> {
        Ok(self.client()?.last_handed_out())
    }
}

impl<D: Driver> Default for SharedClient<D> {
    fn default() -> Self {
        Self::new()
    }
}
