//! Per-shard connection management and autocommit execution.
//!
//! One physical connection per shard, established on first use. Drivers are
//! expected to pool internally; the manager only guarantees that a single
//! connection object per shard survives concurrent first use.
use std::collections::HashMap;
use std::sync::Arc;

use sharda_driver::{DriverError, DriverRegistry, PhysicalConnection, PreparedHandle, StatementOutput};
use sharda_shard::RoutePlan;
use sharda_topology::{ConfigError, Shard, ShardId, ShardTopology, StoreSpec};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

mod outcome;

pub use outcome::{BroadcastError, ExecError, Outcome, ShardExecutionError, ShardOutput};

struct Slot {
    driver: String,
    dsn: String,
    conn: OnceCell<Arc<dyn PhysicalConnection>>,
}

impl Slot {
    fn new(driver: &str, dsn: &str) -> Self {
        Self {
            driver: driver.to_string(),
            dsn: dsn.to_string(),
            conn: OnceCell::new(),
        }
    }
}

pub struct PoolManager {
    registry: DriverRegistry,
    shards: HashMap<ShardId, Slot>,
    sequencer: Option<Slot>,
}

impl PoolManager {
    /// Fails with `UnknownDriver` when a shard or the sequencer store names a
    /// driver missing from `registry`. No connection is opened here.
    pub fn new(topology: &ShardTopology, registry: DriverRegistry) -> Result<Self, ConfigError> {
        let check = |name: &str, driver: &str| {
            if registry.contains(driver) {
                Ok(())
            } else {
                Err(ConfigError::UnknownDriver {
                    shard: name.to_string(),
                    driver: driver.to_string(),
                })
            }
        };
        let mut shards = HashMap::new();
        for shard in topology.all_shards() {
            check(&shard.name, &shard.driver)?;
            shards.insert(shard.id.clone(), Slot::new(&shard.driver, &shard.dsn));
        }
        let sequencer = match topology.sequencer_store() {
            Some(StoreSpec { driver, dsn }) => {
                check("sequencer", driver)?;
                Some(Slot::new(driver, dsn))
            }
            None => None,
        };
        Ok(Self {
            registry,
            shards,
            sequencer,
        })
    }

    async fn connect(&self, slot: &Slot) -> Result<Arc<dyn PhysicalConnection>, DriverError> {
        slot.conn
            .get_or_try_init(|| async {
                let driver = self
                    .registry
                    .get(&slot.driver)
                    .ok_or_else(|| DriverError::Unavailable(format!("driver {} not registered", slot.driver)))?;
                debug!(driver = %slot.driver, dsn = %slot.dsn, "connecting");
                driver.connect(&slot.dsn).await
            })
            .await
            .cloned()
    }

    /// Cached connection of `shard`, established on first call.
    pub async fn connection_for(&self, shard: &Shard) -> Result<Arc<dyn PhysicalConnection>, ShardExecutionError> {
        let slot = self.shards.get(&shard.id).ok_or_else(|| {
            ShardExecutionError::new(
                shard.id.clone(),
                DriverError::Unavailable(format!("shard {} is not part of the topology", shard.name)),
            )
        })?;
        self.connect(slot)
            .await
            .map_err(|e| ShardExecutionError::new(shard.id.clone(), e))
    }

    /// Connection of the sequencer counter store.
    pub async fn sequencer_connection(&self) -> Result<Arc<dyn PhysicalConnection>, DriverError> {
        match &self.sequencer {
            Some(slot) => self.connect(slot).await,
            None => Err(DriverError::Unavailable("no sequencer store configured".into())),
        }
    }

    /// Run `plan` in autocommit mode on every target, in topology order.
    #[instrument(skip_all, fields(table = %plan.table, kind = %plan.kind))]
    pub async fn execute_plan(&self, plan: &RoutePlan) -> Result<Outcome, ExecError> {
        self.run(plan, None).await
    }

    /// Like [`execute_plan`](Self::execute_plan), through prepared handles.
    #[instrument(skip_all, fields(table = %plan.table, kind = %plan.kind))]
    pub async fn execute_prepared_plan(&self, plan: &RoutePlan, cache: &PreparedCache) -> Result<Outcome, ExecError> {
        self.run(plan, Some(cache)).await
    }

    async fn run(&self, plan: &RoutePlan, cache: Option<&PreparedCache>) -> Result<Outcome, ExecError> {
        let mut results = Vec::new();
        let mut failures = Vec::new();
        for shard in plan.route.shards() {
            let output = match cache {
                Some(cache) => self.run_prepared(shard, plan, cache).await,
                None => self.run_direct(shard, plan).await,
            };
            match output {
                Ok(output) => results.push(ShardOutput {
                    shard: shard.id.clone(),
                    output,
                }),
                Err(e) => {
                    warn!(shard = %e.shard, error = %e.source, "statement failed on shard");
                    failures.push(e);
                }
            }
        }
        let outcome = Outcome::collect(results, plan.generated_id);
        if failures.is_empty() {
            return Ok(outcome);
        }
        if !plan.route.is_broadcast() {
            return Err(ExecError::Shard(failures.remove(0)));
        }
        Err(BroadcastError {
            succeeded: outcome,
            failures,
        }
        .into())
    }

    async fn run_direct(&self, shard: &Shard, plan: &RoutePlan) -> Result<StatementOutput, ShardExecutionError> {
        let conn = self.connection_for(shard).await?;
        conn.execute(&plan.sql, &plan.args)
            .await
            .map_err(|e| ShardExecutionError::new(shard.id.clone(), e))
    }

    async fn run_prepared(
        &self,
        shard: &Shard,
        plan: &RoutePlan,
        cache: &PreparedCache,
    ) -> Result<StatementOutput, ShardExecutionError> {
        let tag = |e| ShardExecutionError::new(shard.id.clone(), e);
        if cache.cancel.is_cancelled() {
            return Err(tag(DriverError::Cancelled));
        }
        let conn = self.connection_for(shard).await?;
        // Statements rewritten with a generated id are one-offs.
        if plan.sql != cache.sql {
            let handle = conn.prepare(&plan.sql, &cache.cancel).await.map_err(tag)?;
            return handle.execute(&plan.args).await.map_err(tag);
        }
        let handle = {
            let mut handles = cache.handles.lock().await;
            match handles.get(&shard.id).cloned() {
                Some(h) => h,
                None => {
                    let prepared = conn.prepare(&plan.sql, &cache.cancel).await.map_err(tag)?;
                    let h: Arc<dyn PreparedHandle> = Arc::from(prepared);
                    handles.insert(shard.id.clone(), h.clone());
                    h
                }
            }
        };
        handle.execute(&plan.args).await.map_err(tag)
    }
}

/// Physical prepared handles of one caller-facing prepared statement, per shard.
pub struct PreparedCache {
    sql: String,
    cancel: CancellationToken,
    handles: Mutex<HashMap<ShardId, Arc<dyn PreparedHandle>>>,
}

impl PreparedCache {
    pub fn new(sql: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            sql: sql.into(),
            cancel,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn handle_count(&self) -> usize {
        self.handles.lock().await.len()
    }
}
