//! Session liveness probing and post-use reset.
//!
//! The pool runs [`is_alive`] on every release to decide whether a session
//! goes back into rotation, and [`reset`] to scrub per-use state off the ones
//! that do. After a successful reset a session has no pending results and
//! autocommit re-enabled; an open transaction is implicitly gone.

use crate::driver::{DriverError, RawSession};
use crate::pool::PooledSession;
use tracing::{debug, warn};

/// Probe a session: drain any pending multi-result cursors, then run a
/// trivial round-trip. True iff both succeed.
pub async fn is_alive<S: RawSession>(session: &mut PooledSession<S>) -> bool {
    if !session.raw().connected() {
        debug!(session_id = %session.id(), "session transport is down");
        return false;
    }

    if drain_results(session.raw_mut()).is_err() {
        return false;
    }

    match session.raw_mut().query("SELECT 1").await {
        Ok(()) => true,
        Err(error) => {
            debug!(session_id = %session.id(), error = %error, "liveness probe failed");
            false
        }
    }
}

/// Scrub per-use state: drain pending results and re-enable autocommit.
///
/// Errors are tolerated; a session that cannot be reset will fail its next
/// liveness probe and drop out of the pool then.
pub async fn reset<S: RawSession>(session: &mut PooledSession<S>) {
    if let Err(error) = drain_results(session.raw_mut()) {
        warn!(session_id = %session.id(), error = %error, "failed to drain pending results");
    }

    if !session.raw().autocommit() {
        if let Err(error) = session.raw_mut().set_autocommit(true).await {
            warn!(session_id = %session.id(), error = %error, "failed to re-enable autocommit");
        }
    }
}

fn drain_results<S: RawSession>(raw: &mut S) -> Result<(), DriverError> {
    while raw.more_results() {
        raw.next_result()?;
    }
    Ok(())
}
