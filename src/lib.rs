//! Asynchronous MySQL client library.
//!
//! Provides non-blocking query execution over a host-supplied MySQL client
//! library, a bounded connection pool with fair FIFO waiter queueing, and a
//! transaction runner with retry, isolation-level control, and
//! commit/rollback hooks. Designed for cooperative schedulers where many
//! tasks share a small fixed number of sessions.

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod factory;
pub mod health;
pub mod params;
pub mod pool;
pub mod registry;
pub mod transaction;

pub use client::{Client, SharedClient};
pub use config::{Config, DEFAULT_CHARSET, OptionValue};
pub use error::{BoxError, Error, QueryStage, Result, TxStage};
pub use executor::{FetchShape, QueryExecutor, QueryOutput, Row};
pub use params::{Param, detect_types, preprocess};
pub use pool::{Pool, PoolStats, PooledSession, SessionId};
pub use registry::TransactionRegistry;
pub use transaction::{AttemptRecord, IsolationLevel, Transaction, TxOptions};
