//! Error types for the client library.
//!
//! All driver-level failures are wrapped into one of these variants before
//! they cross the crate boundary; callers never see a raw [`DriverError`]
//! outside of a `source` chain.

use crate::driver::DriverError;
use crate::params::Param;
use crate::transaction::AttemptRecord;
use thiserror::Error;

/// Boxed error type carried by transaction callbacks and hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for all public operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The executor stage at which a query failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Prepare,
    Bind,
    Execute,
    Poll,
    Reap,
    Unexpected,
}

impl std::fmt::Display for QueryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::Prepare => "prepare",
            Self::Bind => "bind",
            Self::Execute => "execute",
            Self::Poll => "poll",
            Self::Reap => "reap",
            Self::Unexpected => "unexpected",
        };
        write!(f, "{tag}")
    }
}

/// The runner stage at which a transaction attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    Begin,
    Commit,
    Rollback,
    Isolation,
    CommitHook,
    RollbackHook,
}

impl std::fmt::Display for TxStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Isolation => "isolation",
            Self::CommitHook => "commit-hook",
            Self::RollbackHook => "rollback-hook",
        };
        write!(f, "{tag}")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: `{field}` must be {expected}")]
    ConfigInvalid {
        field: &'static str,
        expected: &'static str,
    },

    #[error("client is not initialized")]
    NotInitialized,

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        source: DriverError,
    },

    #[error("query failed at {stage}: {sql}")]
    Query {
        stage: QueryStage,
        sql: String,
        params: Vec<Param>,
        #[source]
        source: DriverError,
    },

    #[error("transaction failed at {stage}")]
    Transaction {
        stage: TxStage,
        #[source]
        source: BoxError,
    },

    #[error("no transaction is active on the current task")]
    NotInTransaction,

    #[error("transaction failed after {attempts} attempt(s)")]
    TransactionFailed {
        attempts: u32,
        history: Vec<AttemptRecord>,
        #[source]
        source: BoxError,
    },

    #[error("invalid argument: `{name}`")]
    InvalidArgument { name: &'static str },
}

impl Error {
    /// Create a configuration error naming the offending field.
    pub fn config_invalid(field: &'static str, expected: &'static str) -> Self {
        Self::ConfigInvalid { field, expected }
    }

    /// Wrap a driver failure that occurred while establishing a session.
    pub fn connection(message: impl Into<String>, source: DriverError) -> Self {
        Self::Connection {
            message: message.into(),
            source,
        }
    }

    /// Wrap a driver failure with the executor stage and query context.
    pub fn query(
        stage: QueryStage,
        sql: impl Into<String>,
        params: &[Param],
        source: DriverError,
    ) -> Self {
        Self::Query {
            stage,
            sql: sql.into(),
            params: params.to_vec(),
            source,
        }
    }

    /// Wrap a failure that occurred in the transaction runner.
    pub fn transaction(stage: TxStage, source: impl Into<BoxError>) -> Self {
        Self::Transaction {
            stage,
            source: source.into(),
        }
    }

    /// Create an invalid-argument error naming the parameter.
    pub fn invalid_argument(name: &'static str) -> Self {
        Self::InvalidArgument { name }
    }

    /// The executor stage for query errors, if this is one.
    pub fn query_stage(&self) -> Option<QueryStage> {
        match self {
            Self::Query { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The runner stage for transaction errors, if this is one.
    pub fn tx_stage(&self) -> Option<TxStage> {
        match self {
            Self::Transaction { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
