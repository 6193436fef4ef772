//! Bounded connection pool with a fair FIFO waiter queue.
//!
//! The pool owns every session it creates and loans each one to at most one
//! task at a time. Saturated acquires queue a one-shot waiter slot; releases
//! health-check the returning session and hand it straight to the oldest
//! waiter, so a session never sits idle while someone is queued.

use crate::config::Config;
use crate::driver::{Driver, RawSession};
use crate::error::{Error, Result};
use crate::{factory, health};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of one pooled session, stable for its whole lifetime.
///
/// Loaned sessions cannot be aliased, so pool observability surfaces
/// (`last_handed_out`, logs) speak in ids rather than handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One pool-owned session, loaned out exclusively to one task at a time.
pub struct PooledSession<S: RawSession> {
    id: SessionId,
    raw: S,
    created_at: Instant,
}

impl<S: RawSession> PooledSession<S> {
    pub(crate) fn new(raw: S) -> Self {
        Self {
            id: SessionId::generate(),
            raw,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Server-side connection thread id.
    pub fn thread_id(&self) -> u64 {
        self.raw.thread_id()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn raw(&self) -> &S {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut S {
        &mut self.raw
    }
}

impl<S: RawSession> std::fmt::Debug for PooledSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("thread_id", &self.raw.thread_id())
            .finish_non_exhaustive()
    }
}

/// Point-in-time pool statistics. Field names are part of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub live_count: usize,
    pub idle_count: usize,
    pub waiter_count: usize,
    pub capacity: usize,
    pub persistent: bool,
    pub validated: bool,
}

type Waiter<S> = oneshot::Sender<Result<PooledSession<S>>>;

struct PoolState<S: RawSession> {
    idle: VecDeque<PooledSession<S>>,
    waiters: VecDeque<Waiter<S>>,
    /// idle + loaned out + currently being created.
    live: usize,
    last_handed_out: Option<SessionId>,
    closed: bool,
}

struct PoolInner<D: Driver> {
    driver: D,
    config: Config,
    capacity: usize,
    state: Mutex<PoolState<D::Session>>,
}

/// Bounded session pool. Cheap to clone; clones share the same pool.
pub struct Pool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Driver> std::fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pool({:p})", Arc::as_ptr(&self.inner))
    }
}

enum AcquirePlan<S: RawSession> {
    Ready(PooledSession<S>),
    Grow,
    Wait(oneshot::Receiver<Result<PooledSession<S>>>),
}

impl<D: Driver> Pool<D> {
    /// Create a pool over a validated configuration.
    ///
    /// Sessions are created on demand, up to `capacity`.
    pub fn new(driver: D, config: Config, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid_argument("capacity"));
        }
        config.validate()?;

        info!(
            endpoint = %config.masked(),
            capacity,
            persistent = config.persistent,
            "pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                driver,
                config,
                capacity,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    live: 0,
                    last_handed_out: None,
                    closed: false,
                }),
            }),
        })
    }

    /// Borrow a ready-to-use session.
    ///
    /// Resolves immediately from the idle queue, grows the pool when below
    /// capacity, and otherwise suspends until a releaser hands a session
    /// over. Waiters are served strictly in enqueue order.
    pub async fn acquire(&self) -> Result<PooledSession<D::Session>> {
        let plan = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            if let Some(session) = state.idle.pop_front() {
                state.last_handed_out = Some(session.id());
                AcquirePlan::Ready(session)
            } else if state.live < self.inner.capacity {
                state.live += 1;
                AcquirePlan::Grow
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                AcquirePlan::Wait(rx)
            }
        };

        match plan {
            AcquirePlan::Ready(session) => {
                debug!(session_id = %session.id(), "reusing idle session");
                Ok(session)
            }
            AcquirePlan::Grow => self.grow().await,
            AcquirePlan::Wait(rx) => rx.await.map_err(|_| Error::PoolClosed)?,
        }
    }

    async fn grow(&self) -> Result<PooledSession<D::Session>> {
        match factory::connect(&self.inner.driver, &self.inner.config).await {
            Ok(session) => {
                let discard = {
                    let mut state = self.inner.state.lock();
                    if state.closed {
                        state.live -= 1;
                        true
                    } else {
                        state.last_handed_out = Some(session.id());
                        false
                    }
                };
                if discard {
                    let mut session = session;
                    session.raw_mut().close().await;
                    return Err(Error::PoolClosed);
                }
                Ok(session)
            }
            Err(error) => {
                self.inner.state.lock().live -= 1;
                Err(error)
            }
        }
    }

    /// Return a loaned session. Never waits on capacity.
    ///
    /// The session is health-checked: an alive session is reset and handed to
    /// the oldest waiter (or parked idle); a dead one is closed and, when a
    /// waiter is queued, replaced by a freshly created session for that
    /// waiter only. Each acquired session must be released exactly once.
    pub async fn release(&self, mut session: PooledSession<D::Session>) {
        debug_assert!(
            {
                let state = self.inner.state.lock();
                state.idle.iter().all(|idle| idle.id() != session.id())
            },
            "session released twice"
        );

        if self.inner.state.lock().closed {
            debug!(session_id = %session.id(), "pool closed; discarding released session");
            session.raw_mut().close().await;
            self.inner.state.lock().live -= 1;
            return;
        }

        if health::is_alive(&mut session).await {
            health::reset(&mut session).await;
            if let Some(mut discard) = self.hand_back(session) {
                discard.raw_mut().close().await;
            }
        } else {
            self.replace_dead(session).await;
        }
    }

    /// Route an alive session to the oldest waiter, falling back to the idle
    /// queue. Returns a session the caller must close (pool closed mid-way).
    fn hand_back(
        &self,
        mut session: PooledSession<D::Session>,
    ) -> Option<PooledSession<D::Session>> {
        loop {
            let waiter = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    state.live -= 1;
                    return Some(session);
                }
                match state.waiters.pop_front() {
                    Some(waiter) => {
                        state.last_handed_out = Some(session.id());
                        waiter
                    }
                    None => {
                        state.idle.push_back(session);
                        return None;
                    }
                }
            };
            match waiter.send(Ok(session)) {
                Ok(()) => return None,
                // Waiter gave up before being served; its slot simply
                // disappears and the session moves on to the next one.
                Err(Ok(returned)) => session = returned,
                Err(Err(_)) => unreachable!("waiter payload is always a session"),
            }
        }
    }

    async fn replace_dead(&self, mut session: PooledSession<D::Session>) {
        warn!(
            session_id = %session.id(),
            thread_id = session.thread_id(),
            "discarding dead session"
        );
        session.raw_mut().close().await;
        drop(session);

        let replace = {
            let mut state = self.inner.state.lock();
            state.live -= 1;
            if !state.closed && !state.waiters.is_empty() && state.live < self.inner.capacity {
                state.live += 1;
                true
            } else {
                false
            }
        };
        if !replace {
            return;
        }

        match factory::connect(&self.inner.driver, &self.inner.config).await {
            Ok(fresh) => {
                debug!(session_id = %fresh.id(), "replacement session created for waiter");
                if let Some(mut discard) = self.hand_back(fresh) {
                    discard.raw_mut().close().await;
                }
            }
            Err(error) => {
                // The head waiter inherits the factory failure; nobody else
                // is affected.
                let waiter = {
                    let mut state = self.inner.state.lock();
                    state.live -= 1;
                    state.waiters.pop_front()
                };
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Err(error));
                    }
                    None => warn!(error = %error, "replacement failed with no waiter left"),
                }
            }
        }
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            live_count: state.live,
            idle_count: state.idle.len(),
            waiter_count: state.waiters.len(),
            capacity: self.inner.capacity,
            persistent: self.inner.config.persistent,
            validated: true,
        }
    }

    /// Id of the session most recently handed to a caller.
    pub fn last_handed_out(&self) -> Option<SessionId> {
        self.inner.state.lock().last_handed_out
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// The configuration this pool was built from.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Shut the pool down: every pending waiter is rejected with
    /// [`Error::PoolClosed`], idle sessions are closed, and sessions still
    /// loaned out are discarded when their holders release them.
    pub async fn close(&self) {
        let (waiters, idle) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.idle),
            )
        };

        info!(
            rejected_waiters = waiters.len(),
            idle_sessions = idle.len(),
            "closing pool"
        );

        for waiter in waiters {
            let _ = waiter.send(Err(Error::PoolClosed));
        }
        for mut session in idle {
            session.raw_mut().close().await;
            self.inner.state.lock().live -= 1;
        }
    }
}
