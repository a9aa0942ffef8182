//! Sharda: statement routing, id sequencing and multi-shard transactions
//! over independent SQL databases.
//!
//! ```no_run
//! # async fn demo() -> Result<(), sharda::Error> {
//! use std::sync::Arc;
//! use sharda::{memory::MemoryDriver, ShardTopology, ShardedDb, Value};
//!
//! let topology = ShardTopology::load("topology.yml")?;
//! let db = ShardedDb::builder(topology)
//!     .driver(Arc::new(MemoryDriver::default()))
//!     .build()
//!     .await?;
//! db.execute("insert into users (id, name) values (null, ?)", &[Value::from("bob")]).await?;
//! # Ok(())
//! # }
//! ```
use sharda_shard::RouteError;
use sharda_txn::TxnError;
use thiserror::Error;

mod db;

pub use db::{PreparedStatement, ShardedDb, ShardedDbBuilder};
pub use sharda_driver::{memory, Driver, DriverError, DriverRegistry, ExecResult, PhysicalConnection, Rows, StatementOutput};
pub use sharda_parser::{StatementKind, Value};
pub use sharda_pool::{BroadcastError, ExecError, Outcome, ShardExecutionError, ShardOutput};
pub use sharda_seq::SequencerError;
pub use sharda_shard::{Route, RoutePlan};
pub use sharda_topology::{ConfigError, Shard, ShardId, ShardTopology};
pub use sharda_txn::{BoxError, LogicalTransaction, QueryLogEntry, TxnId, TxnInfo, TxnState};
pub use tokio_util::sync::CancellationToken;

/// Every failure a caller can see.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Txn(#[from] TxnError),
    #[error("operation cancelled")]
    Cancelled,
}

/// Error categories callers are expected to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or missing topology; fatal at startup.
    Config,
    /// Statement outside what the classifier understands; nothing ran.
    UnsupportedQuery,
    /// Key and topology disagree; a configuration problem.
    Routing,
    /// Counter store failed; nothing ran.
    Sequencer,
    /// One shard failed; the shard is attached to the error.
    ShardExecution,
    /// Autocommit broadcast failed on some shards only.
    PartialBroadcast,
    HookRejected,
    /// Some shards committed and cannot be rolled back. Needs manual reconciliation.
    CriticalPartialCommit,
    Cancelled,
    Internal,
}

fn route_kind(e: &RouteError) -> ErrorKind {
    match e {
        RouteError::Parse(_) | RouteError::Unsupported(_) => ErrorKind::UnsupportedQuery,
        RouteError::Config(_) => ErrorKind::Config,
        RouteError::OutOfRange { .. } | RouteError::InvalidShardKey { .. } => ErrorKind::Routing,
        RouteError::Sequencer(_) => ErrorKind::Sequencer,
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Route(e) => route_kind(e),
            Error::Sequencer(_) => ErrorKind::Sequencer,
            Error::Exec(ExecError::Shard(e)) if matches!(e.source, DriverError::Cancelled) => ErrorKind::Cancelled,
            Error::Exec(ExecError::Shard(_)) => ErrorKind::ShardExecution,
            Error::Exec(ExecError::PartialBroadcast(_)) => ErrorKind::PartialBroadcast,
            Error::Txn(e) => match e {
                TxnError::Route(r) => route_kind(r),
                TxnError::Shard(_) | TxnError::CommitFailed { .. } => ErrorKind::ShardExecution,
                TxnError::HookRejected { .. } => ErrorKind::HookRejected,
                TxnError::CriticalPartialCommit { .. } => ErrorKind::CriticalPartialCommit,
                TxnError::Internal { .. } => ErrorKind::Internal,
            },
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.kind() == ErrorKind::CriticalPartialCommit
    }

    /// Shard the failure is attributed to, if any.
    pub fn shard(&self) -> Option<&ShardId> {
        match self {
            Error::Exec(ExecError::Shard(e)) => Some(&e.shard),
            Error::Exec(ExecError::PartialBroadcast(b)) => b.first_error().map(|e| &e.shard),
            Error::Txn(TxnError::Shard(e)) | Error::Txn(TxnError::CommitFailed { source: e, .. }) => Some(&e.shard),
            Error::Txn(TxnError::CriticalPartialCommit { failed, .. }) => Some(failed),
            _ => None,
        }
    }

    /// Successful part of a partially failed broadcast.
    pub fn partial_broadcast(&self) -> Option<&BroadcastError> {
        match self {
            Error::Exec(ExecError::PartialBroadcast(b)) => Some(b),
            _ => None,
        }
    }
}
