use std::sync::Arc;

use sharda_driver::{Driver, DriverRegistry};
use sharda_parser::{Statement, Value};
use sharda_pool::{Outcome, PoolManager, PreparedCache};
use sharda_seq::{ConnectionCounterStore, Sequencer, SequencerError};
use sharda_shard::{RouteError, Router};
use sharda_topology::ShardTopology;
use sharda_txn::{BoxError, HookRegistry, LogicalTransaction, QueryLogEntry, TxnCoordinator, TxnInfo};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Error;

/// Configures drivers and commit hooks, then connects the sequencer store.
pub struct ShardedDbBuilder {
    topology: Arc<ShardTopology>,
    registry: DriverRegistry,
    hooks: HookRegistry,
}

impl ShardedDbBuilder {
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.registry.register(driver);
        self
    }

    pub fn before_commit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TxnInfo, &[QueryLogEntry]) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hooks.on_before_commit(hook);
        self
    }

    pub fn after_commit<S, F>(mut self, success: S, failure: F) -> Self
    where
        S: Fn(&TxnInfo) + Send + Sync + 'static,
        F: Fn(&TxnInfo, bool, &[QueryLogEntry]) + Send + Sync + 'static,
    {
        self.hooks.on_after_commit(success, failure);
        self
    }

    pub async fn build(self) -> Result<ShardedDb, Error> {
        let pool = Arc::new(PoolManager::new(&self.topology, self.registry)?);
        let sequencer = match self.topology.sequencer_store() {
            Some(store) => {
                let conn = pool
                    .sequencer_connection()
                    .await
                    .map_err(|source| SequencerError::Unavailable {
                        counter: store.dsn.clone(),
                        source,
                    })?;
                Some(Arc::new(Sequencer::new(Arc::new(ConnectionCounterStore::new(conn)))))
            }
            None => None,
        };
        let router = Arc::new(Router::new(self.topology.clone(), sequencer));
        let coordinator = Arc::new(TxnCoordinator::new(router.clone(), pool.clone(), self.hooks));
        info!(
            shards = self.topology.all_shards().count(),
            tables = self.topology.rules().len(),
            "sharded database ready"
        );
        Ok(ShardedDb {
            topology: self.topology,
            router,
            pool,
            coordinator,
        })
    }
}

/// Single-connection-like handle over every shard of a topology.
///
/// Cheap to share behind an `Arc`; logical transactions are owned by the
/// caller that began them.
pub struct ShardedDb {
    topology: Arc<ShardTopology>,
    router: Arc<Router>,
    pool: Arc<PoolManager>,
    coordinator: Arc<TxnCoordinator>,
}

impl ShardedDb {
    pub fn builder(topology: impl Into<Arc<ShardTopology>>) -> ShardedDbBuilder {
        ShardedDbBuilder {
            topology: topology.into(),
            registry: DriverRegistry::new(),
            hooks: HookRegistry::new(),
        }
    }

    pub fn topology(&self) -> &ShardTopology {
        &self.topology
    }

    /// Run one statement in autocommit mode. Results are per shard, in
    /// topology order.
    pub async fn execute(&self, sql: &str, args: &[Value]) -> Result<Outcome, Error> {
        let plan = self.router.plan(sql, args).await?;
        Ok(self.pool.execute_plan(&plan).await?)
    }

    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement, Error> {
        self.prepare_with_cancel(sql, CancellationToken::new())
    }

    /// Parses and checks the table rule now; shards prepare on first use and
    /// stop accepting work once `cancel` fires.
    pub fn prepare_with_cancel(&self, sql: &str, cancel: CancellationToken) -> Result<PreparedStatement, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let stmt = sharda_parser::parse(sql).map_err(RouteError::from)?;
        self.topology.resolve_rule(stmt.table())?;
        Ok(PreparedStatement {
            sql: sql.to_string(),
            stmt,
            router: self.router.clone(),
            pool: self.pool.clone(),
            cache: PreparedCache::new(sql, cancel),
        })
    }

    pub fn begin(&self) -> LogicalTransaction {
        self.coordinator.begin()
    }
}

pub struct PreparedStatement {
    sql: String,
    stmt: Statement,
    router: Arc<Router>,
    pool: Arc<PoolManager>,
    cache: PreparedCache,
}

impl PreparedStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub async fn execute(&self, args: &[Value]) -> Result<Outcome, Error> {
        if self.cache.cancel_token().is_cancelled() {
            return Err(Error::Cancelled);
        }
        let plan = self.router.plan_statement(&self.stmt, &self.sql, args).await?;
        Ok(self.pool.execute_prepared_plan(&plan, &self.cache).await?)
    }

    /// Run inside a logical transaction instead of autocommit.
    pub async fn execute_in(&self, tx: &mut LogicalTransaction, args: &[Value]) -> Result<Outcome, Error> {
        if self.cache.cancel_token().is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(tx.execute_statement(&self.stmt, &self.sql, args).await?)
    }
}
