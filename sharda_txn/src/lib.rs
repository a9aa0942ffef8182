//! Logical transactions spanning several shards.
//!
//! There is no atomic commit across shards. Local transactions are committed
//! one by one in topology order, and a failure after some shard already
//! committed writes is reported as a critical partial commit.
use sharda_pool::ShardExecutionError;
use sharda_shard::RouteError;
use sharda_topology::ShardId;
use thiserror::Error;

mod coordinator;
mod gtm;
mod hooks;

pub use coordinator::{LogicalTransaction, TxnCoordinator};
pub use gtm::{TxnId, TxnIds};
pub use hooks::{BoxError, HookRegistry, QueryLogEntry, TxnInfo};

/// Lifecycle of a logical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    Open,
    Committing,
    Committed,
    RolledBack,
    /// Some shards committed writes before another failed.
    PartiallyCommitted,
}

#[derive(Debug, Error)]
pub enum TxnError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Shard(#[from] ShardExecutionError),
    #[error("{txn}: before-commit hook {hook} rejected the commit: {source}")]
    HookRejected {
        txn: TxnId,
        hook: usize,
        #[source]
        source: BoxError,
    },
    /// No shard with writes committed; everything was rolled back.
    #[error("{txn}: commit failed, transaction rolled back: {source}")]
    CommitFailed {
        txn: TxnId,
        #[source]
        source: ShardExecutionError,
    },
    /// A shard committed writes before a later shard failed; those writes stay.
    /// Shards that committed without writes do not count, so a failure after a
    /// read-only prefix is `CommitFailed`.
    #[error("{txn}: CRITICAL partial commit, committed [{}] before {failed} failed: {source}", shard_list(.committed))]
    CriticalPartialCommit {
        txn: TxnId,
        committed: Vec<ShardId>,
        failed: ShardId,
        #[source]
        source: ShardExecutionError,
    },
    #[error("{txn}: commit task failed: {reason}")]
    Internal { txn: TxnId, reason: String },
}

fn shard_list(shards: &[ShardId]) -> String {
    shards.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

impl TxnError {
    pub fn is_critical(&self) -> bool {
        matches!(self, TxnError::CriticalPartialCommit { .. })
    }

    /// State the transaction ended in, `None` when it is still open.
    pub fn final_state(&self) -> Option<TxnState> {
        match self {
            TxnError::Route(_) | TxnError::Shard(_) => None,
            TxnError::HookRejected { .. } | TxnError::CommitFailed { .. } => Some(TxnState::RolledBack),
            TxnError::CriticalPartialCommit { .. } => Some(TxnState::PartiallyCommitted),
            TxnError::Internal { .. } => Some(TxnState::Committing),
        }
    }
}
