//! Session construction.
//!
//! One entry point: take a validated configuration, perform the handshake,
//! apply driver options, set the character set, and wrap the result into a
//! pool-owned session. Any step failing surfaces as [`Error::Connection`]
//! and tears the half-built session down.

use crate::config::Config;
use crate::driver::{Driver, RawSession};
use crate::error::{Error, Result};
use crate::pool::PooledSession;
use tracing::debug;

/// Build one configured session from `config`.
pub async fn connect<D: Driver>(driver: &D, config: &Config) -> Result<PooledSession<D::Session>> {
    let mut raw = driver
        .connect(config, config.persistent)
        .await
        .map_err(|error| Error::connection(format!("handshake with {}", config.masked()), error))?;

    for (code, value) in &config.options {
        if let Err(error) = raw.set_option(*code, value) {
            raw.close().await;
            return Err(Error::connection(
                format!("setting driver option {code}"),
                error,
            ));
        }
    }

    if let Err(error) = raw.set_charset(&config.charset).await {
        raw.close().await;
        return Err(Error::connection(
            format!("setting charset {}", config.charset),
            error,
        ));
    }

    let session = PooledSession::new(raw);
    debug!(
        session_id = %session.id(),
        thread_id = session.thread_id(),
        endpoint = %config.masked(),
        persistent = config.persistent,
        "session established"
    );
    Ok(session)
}
