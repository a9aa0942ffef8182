use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use sharda_driver::ShardTransaction;
use sharda_parser::{Statement, Value};
use sharda_pool::{Outcome, PoolManager, ShardExecutionError, ShardOutput};
use sharda_shard::Router;
use sharda_topology::{Shard, ShardId};
use tracing::{debug, error, info, instrument, warn};

use crate::gtm::{TxnId, TxnIds};
use crate::hooks::{HookRegistry, QueryLogEntry, TxnInfo};
use crate::{TxnError, TxnState};

/// Starts logical transactions and drives their commit.
pub struct TxnCoordinator {
    router: Arc<Router>,
    pool: Arc<PoolManager>,
    hooks: HookRegistry,
    ids: TxnIds,
}

struct Participant {
    tx: Box<dyn ShardTransaction>,
    log: Vec<QueryLogEntry>,
}

impl TxnCoordinator {
    pub fn new(router: Arc<Router>, pool: Arc<PoolManager>, hooks: HookRegistry) -> Self {
        Self {
            router,
            pool,
            hooks,
            ids: TxnIds::default(),
        }
    }

    /// New empty transaction. No shard is touched until the first statement.
    pub fn begin(self: &Arc<Self>) -> LogicalTransaction {
        let id = self.ids.alloc();
        debug!(txn = %id, "transaction started");
        LogicalTransaction {
            id,
            coordinator: self.clone(),
            participants: BTreeMap::new(),
            next_seq: 0,
            state: TxnState::Open,
        }
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    async fn finish_commit(&self, id: TxnId, participants: BTreeMap<ShardId, Participant>) -> Result<(), TxnError> {
        let info = TxnInfo {
            id,
            shards: participants.keys().cloned().collect(),
        };
        let mut log: Vec<QueryLogEntry> = participants.values().flat_map(|p| p.log.iter().cloned()).collect();
        log.sort_by_key(|e| e.seq);

        if let Err((hook, source)) = self.hooks.before_commit(&info, &log) {
            warn!(txn = %id, hook, error = %source, "commit vetoed, rolling back");
            rollback_all(id, participants.into_iter()).await;
            return Err(TxnError::HookRejected { txn: id, hook, source });
        }

        let mut committed: Vec<(ShardId, bool)> = Vec::new();
        let mut remaining = participants.into_iter();
        while let Some((shard, participant)) = remaining.next() {
            let had_writes = !participant.log.is_empty();
            if let Err(e) = participant.tx.commit().await {
                let source = ShardExecutionError::new(shard.clone(), e);
                let mut failed_log = participant.log;
                let rest: Vec<_> = remaining.by_ref().collect();
                for (_, p) in &rest {
                    failed_log.extend(p.log.iter().cloned());
                }
                rollback_all(id, rest.into_iter()).await;

                let critical = committed.iter().any(|(_, writes)| *writes);
                self.hooks.failed(&info, critical, &failed_log);
                let committed: Vec<ShardId> = committed.into_iter().map(|(s, _)| s).collect();
                if critical {
                    error!(
                        txn = %id,
                        failed = %shard,
                        committed = committed.len(),
                        error = %source.source,
                        "partial commit, manual reconciliation required"
                    );
                    return Err(TxnError::CriticalPartialCommit {
                        txn: id,
                        committed,
                        failed: shard,
                        source,
                    });
                }
                warn!(txn = %id, failed = %shard, error = %source.source, "commit failed, rolled back");
                return Err(TxnError::CommitFailed { txn: id, source });
            }
            committed.push((shard, had_writes));
        }

        info!(txn = %id, shards = committed.len(), writes = log.len(), "transaction committed");
        self.hooks.committed(&info);
        Ok(())
    }
}

/// Best effort: every shard is attempted, failures are logged.
async fn rollback_all(id: TxnId, participants: impl Iterator<Item = (ShardId, Participant)>) -> Option<ShardExecutionError> {
    let mut first = None;
    for (shard, p) in participants {
        if let Err(e) = p.tx.rollback().await {
            warn!(txn = %id, shard = %shard, error = %e, "rollback failed");
            first.get_or_insert(ShardExecutionError::new(shard, e));
        }
    }
    first
}

/// A transaction over any number of shards, owned by one caller.
///
/// Local transactions are opened lazily, one per shard the statements route
/// to. Dropping it without `commit` or `rollback` rolls every shard back.
pub struct LogicalTransaction {
    id: TxnId,
    coordinator: Arc<TxnCoordinator>,
    participants: BTreeMap<ShardId, Participant>,
    next_seq: u64,
    state: TxnState,
}

impl LogicalTransaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// `Open` until `commit` or `rollback` consumes the transaction; those
    /// report the final state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Participating shards in commit order.
    pub fn shards(&self) -> Vec<ShardId> {
        self.participants.keys().cloned().collect()
    }

    /// Writes logged so far, in execution order.
    pub fn write_log(&self) -> Vec<QueryLogEntry> {
        let mut log: Vec<_> = self
            .participants
            .values()
            .flat_map(|p| p.log.iter().cloned())
            .collect();
        log.sort_by_key(|e| e.seq);
        log
    }

    pub async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<Outcome, TxnError> {
        let stmt = sharda_parser::parse(sql).map_err(sharda_shard::RouteError::from)?;
        self.execute_statement(&stmt, sql, args).await
    }

    #[instrument(skip_all, fields(txn = %self.id, table = stmt.table()))]
    pub async fn execute_statement(&mut self, stmt: &Statement, sql: &str, args: &[Value]) -> Result<Outcome, TxnError> {
        let plan = self.coordinator.router.plan_statement(stmt, sql, args).await?;
        let mut results = Vec::with_capacity(plan.route.shards().len());
        for shard in plan.route.shards() {
            let seq = self.next_seq;
            let participant = self.participant(shard).await?;
            let output = participant
                .tx
                .execute(&plan.sql, &plan.args)
                .await
                .map_err(|e| ShardExecutionError::new(shard.id.clone(), e))?;
            if plan.kind.is_write() {
                participant.log.push(QueryLogEntry {
                    shard: shard.id.clone(),
                    sql: plan.sql.clone(),
                    args: plan.args.clone(),
                    seq,
                });
                self.next_seq += 1;
            }
            results.push(ShardOutput {
                shard: shard.id.clone(),
                output,
            });
        }
        Ok(Outcome::collect(results, plan.generated_id))
    }

    async fn participant(&mut self, shard: &Shard) -> Result<&mut Participant, ShardExecutionError> {
        let slot = match self.participants.entry(shard.id.clone()) {
            Entry::Occupied(e) => return Ok(e.into_mut()),
            Entry::Vacant(v) => v,
        };
        let conn = self.coordinator.pool.connection_for(shard).await?;
        let tx = conn
            .begin()
            .await
            .map_err(|e| ShardExecutionError::new(shard.id.clone(), e))?;
        debug!(txn = %self.id, shard = %shard.id, "local transaction opened");
        Ok(slot.insert(Participant {
            tx,
            log: Vec::new(),
        }))
    }

    /// Commit every participant sequentially in topology order and return
    /// `TxnState::Committed`.
    ///
    /// The sequence runs on its own task; once started it completes even if
    /// the returned future is dropped.
    pub async fn commit(mut self) -> Result<TxnState, TxnError> {
        let id = self.id;
        self.state = TxnState::Committing;
        let participants = std::mem::take(&mut self.participants);
        let coordinator = self.coordinator.clone();
        debug!(txn = %id, shards = participants.len(), "committing");
        let task = tokio::spawn(async move { coordinator.finish_commit(id, participants).await });
        task.await.map_err(|e| TxnError::Internal {
            txn: id,
            reason: e.to_string(),
        })??;
        Ok(TxnState::Committed)
    }

    /// Roll back every participant. All are attempted; the first failure is returned.
    pub async fn rollback(mut self) -> Result<TxnState, TxnError> {
        self.state = TxnState::RolledBack;
        let participants = std::mem::take(&mut self.participants);
        let shards = participants.len();
        let failed = rollback_all(self.id, participants.into_iter()).await;
        info!(txn = %self.id, shards, "transaction rolled back");
        match failed {
            Some(e) => Err(e.into()),
            None => Ok(TxnState::RolledBack),
        }
    }
}

impl Drop for LogicalTransaction {
    fn drop(&mut self) {
        if self.state == TxnState::Open && !self.participants.is_empty() {
            warn!(
                txn = %self.id,
                shards = self.participants.len(),
                "transaction dropped while open, rolling back"
            );
        }
    }
}
