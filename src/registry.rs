//! Transaction context registry.
//!
//! Each running transaction owns one context: the ordered commit and rollback
//! hook lists for its session. Contexts are keyed by session id and live
//! exactly as long as one transaction attempt; the runner attaches at BEGIN
//! and detaches on every exit path, so a discarded session can never leave an
//! entry behind.
//!
//! "The current transaction" is task-scoped, not thread- or session-scoped:
//! the runner publishes the session id through task-local storage for the
//! duration of the user callback, and [`current_session`] reads it back. Two
//! cooperative tasks in transactions at the same time each see their own.

use crate::error::{BoxError, Error, Result, TxStage};
use crate::pool::SessionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use tracing::debug;

/// A nullary callback fired after commit or rollback.
pub type Hook = Box<dyn FnOnce() -> std::result::Result<(), BoxError> + Send>;

tokio::task_local! {
    static CURRENT_SESSION: SessionId;
}

/// Session id of the transaction the calling task is currently inside, if
/// any. Nested transactions shadow the outer one until they finish.
pub fn current_session() -> Option<SessionId> {
    CURRENT_SESSION.try_with(|id| *id).ok()
}

/// Run `future` with `session` published as the calling task's current
/// transaction. The previous value is visible again once `future` completes.
pub(crate) fn scope_current<F: Future>(
    session: SessionId,
    future: F,
) -> impl Future<Output = F::Output> {
    CURRENT_SESSION.scope(session, future)
}

struct TxContext {
    commit_hooks: Vec<Hook>,
    rollback_hooks: Vec<Hook>,
}

/// Hook lists recovered from a detached context.
pub(crate) struct TxHooks {
    pub commit: Vec<Hook>,
    pub rollback: Vec<Hook>,
}

/// Registry of active transaction contexts, keyed by session id.
pub struct TransactionRegistry {
    entries: Mutex<HashMap<SessionId, TxContext>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert an empty context for `session`. Errors if one already exists.
    pub(crate) fn attach(&self, session: SessionId) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&session) {
            return Err(Error::transaction(
                TxStage::Begin,
                "a transaction is already active on this session",
            ));
        }
        entries.insert(
            session,
            TxContext {
                commit_hooks: Vec::new(),
                rollback_hooks: Vec::new(),
            },
        );
        debug!(session_id = %session, "transaction context attached");
        Ok(())
    }

    /// Remove the context for `session`, returning its hook lists.
    pub(crate) fn detach(&self, session: SessionId) -> Option<TxHooks> {
        let context = self.entries.lock().remove(&session)?;
        debug!(session_id = %session, "transaction context detached");
        Some(TxHooks {
            commit: context.commit_hooks,
            rollback: context.rollback_hooks,
        })
    }

    /// Append a commit hook to `session`'s context.
    pub fn on_commit(&self, session: SessionId, hook: Hook) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&session) {
            Some(context) => {
                context.commit_hooks.push(hook);
                Ok(())
            }
            None => Err(Error::NotInTransaction),
        }
    }

    /// Append a rollback hook to `session`'s context.
    pub fn on_rollback(&self, session: SessionId, hook: Hook) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&session) {
            Some(context) => {
                context.rollback_hooks.push(hook);
                Ok(())
            }
            None => Err(Error::NotInTransaction),
        }
    }

    /// Append a commit hook to the calling task's current transaction.
    pub fn on_commit_current(&self, hook: Hook) -> Result<()> {
        let session = current_session().ok_or(Error::NotInTransaction)?;
        self.on_commit(session, hook)
    }

    /// Append a rollback hook to the calling task's current transaction.
    pub fn on_rollback_current(&self, hook: Hook) -> Result<()> {
        let session = current_session().ok_or(Error::NotInTransaction)?;
        self.on_rollback(session, hook)
    }

    /// Number of active transaction contexts.
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
