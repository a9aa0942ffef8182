use std::sync::Arc;

use sharda_parser::{Expr, Statement, StatementKind, Value};
use sharda_seq::{Sequencer, SequencerError};
use sharda_topology::{Shard, ShardTopology, ShardingRule};
use tracing::{debug, instrument};

use crate::algorithm::router_for;
use crate::classify::{classify, Classification, IdSlot};
use crate::RouteError;

/// Target shards of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Single(Shard),
    /// Every shard of the table's cluster, in topology order.
    Broadcast(Vec<Shard>),
}

impl Route {
    pub fn shards(&self) -> &[Shard] {
        match self {
            Route::Single(shard) => std::slice::from_ref(shard),
            Route::Broadcast(shards) => shards,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Route::Broadcast(_))
    }
}

/// A statement ready to run: targets plus the SQL and arguments to send.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePlan {
    pub table: String,
    pub kind: StatementKind,
    pub route: Route,
    pub sql: String,
    pub args: Vec<Value>,
    pub generated_id: Option<u64>,
}

/// Outcome of a dry run. `route` is `None` when the target depends on an id
/// that would be generated.
#[derive(Debug, Clone, PartialEq)]
pub struct DryRun {
    pub classification: Classification,
    pub route: Option<Route>,
}

/// Shard resolver.
pub struct Router {
    topology: Arc<ShardTopology>,
    sequencer: Option<Arc<Sequencer>>,
}

impl Router {
    pub fn new(topology: Arc<ShardTopology>, sequencer: Option<Arc<Sequencer>>) -> Self {
        Self { topology, sequencer }
    }

    pub fn topology(&self) -> &Arc<ShardTopology> {
        &self.topology
    }

    pub async fn plan(&self, sql: &str, args: &[Value]) -> Result<RoutePlan, RouteError> {
        let stmt = sharda_parser::parse(sql)?;
        self.plan_statement(&stmt, sql, args).await
    }

    /// Resolve the targets of an already parsed statement, generating an id
    /// first when the table's rule asks for one.
    #[instrument(skip_all, fields(table = stmt.table()))]
    pub async fn plan_statement(&self, stmt: &Statement, sql: &str, args: &[Value]) -> Result<RoutePlan, RouteError> {
        let rule = self.topology.resolve_rule(stmt.table())?;
        let class = classify(stmt, &rule, args)?;
        let mut plan = RoutePlan {
            table: class.table.clone(),
            kind: class.kind,
            route: Route::Broadcast(Vec::new()),
            sql: sql.to_string(),
            args: args.to_vec(),
            generated_id: None,
        };
        let mut key = class.shard_key;
        if let Some(slot) = class.id_slot {
            let sequencer = self.sequencer.as_ref().ok_or(SequencerError::NotConfigured)?;
            let id = sequencer.next(&rule.table).await?;
            let value = Value::Integer(id as i64);
            substitute_id(stmt, &rule, slot, value.clone(), &mut plan)?;
            if rule.shards_by_sequence() {
                key = Some(value);
            }
            plan.generated_id = Some(id);
        }
        plan.route = self.route(&rule, key.as_ref())?;
        debug!(
            kind = %plan.kind,
            targets = plan.route.shards().len(),
            generated_id = plan.generated_id,
            "statement routed"
        );
        Ok(plan)
    }

    /// Classify and resolve without calling the sequencer.
    pub fn classify_only(&self, sql: &str, args: &[Value]) -> Result<DryRun, RouteError> {
        let stmt = sharda_parser::parse(sql)?;
        let rule = self.topology.resolve_rule(stmt.table())?;
        let classification = classify(&stmt, &rule, args)?;
        let deferred = classification.needs_generated_id() && rule.shards_by_sequence();
        let route = if deferred {
            None
        } else {
            Some(self.route(&rule, classification.shard_key.as_ref())?)
        };
        Ok(DryRun { classification, route })
    }

    fn route(&self, rule: &ShardingRule, key: Option<&Value>) -> Result<Route, RouteError> {
        let shards = self.topology.shards_in_order(&rule.cluster)?;
        let pick = |ordinal: usize| {
            shards.get(ordinal).cloned().ok_or_else(|| RouteError::OutOfRange {
                table: rule.table.clone(),
                ordinal,
                shards: shards.len(),
            })
        };
        match key {
            Some(key) => {
                let ordinal = router_for(&rule.algorithm, shards.len())
                    .shard_for_key(key)
                    .map_err(|source| RouteError::InvalidShardKey {
                        table: rule.table.clone(),
                        source,
                    })?;
                Ok(Route::Single(pick(ordinal)?))
            }
            None if !rule.is_sharded() => Ok(Route::Single(pick(rule.home_shard)?)),
            None => Ok(Route::Broadcast(shards.to_vec())),
        }
    }
}

/// Write the generated id into the outgoing statement.
fn substitute_id(
    stmt: &Statement,
    rule: &ShardingRule,
    slot: IdSlot,
    value: Value,
    plan: &mut RoutePlan,
) -> Result<(), RouteError> {
    if let IdSlot::Placeholder(i) = slot {
        plan.args[i] = value;
        return Ok(());
    }
    let (Statement::Insert(ins), Some(seq)) = (stmt, &rule.sequencer) else {
        return Err(RouteError::Unsupported("generated id outside INSERT".into()));
    };
    let mut ins = ins.clone();
    match slot {
        IdSlot::Literal(pos) => ins.values[pos] = Expr::Literal(value),
        IdSlot::Omitted => {
            ins.columns.push(seq.column.clone());
            ins.values.push(Expr::Literal(value));
        }
        IdSlot::Placeholder(_) => {}
    }
    plan.sql = Statement::Insert(ins).to_string();
    Ok(())
}
