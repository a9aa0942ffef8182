use std::fmt;

use sharda_driver::{DriverError, StatementOutput};
use sharda_parser::Value;
use sharda_topology::ShardId;
use thiserror::Error;

/// Failure of one physical shard, tagged with its identity.
#[derive(Debug, Error)]
#[error("shard {shard}: {source}")]
pub struct ShardExecutionError {
    pub shard: ShardId,
    #[source]
    pub source: DriverError,
}

impl ShardExecutionError {
    pub fn new(shard: ShardId, source: DriverError) -> Self {
        Self { shard, source }
    }
}

/// Output of one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardOutput {
    pub shard: ShardId,
    pub output: StatementOutput,
}

/// Per-shard results in topology order plus the aggregate counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub results: Vec<ShardOutput>,
    pub rows_affected: u64,
    /// Generated id if one was produced, else the engine's last insert id.
    pub last_insert_id: Option<i64>,
}

impl Outcome {
    pub fn collect(results: Vec<ShardOutput>, generated_id: Option<u64>) -> Self {
        let mut rows_affected = 0;
        let mut last_insert_id = None;
        for exec in results.iter().filter_map(|r| r.output.exec()) {
            rows_affected += exec.rows_affected;
            last_insert_id = exec.last_insert_id.or(last_insert_id);
        }
        Self {
            results,
            rows_affected,
            last_insert_id: generated_id.map(|id| id as i64).or(last_insert_id),
        }
    }

    /// Column names of the first row-returning shard.
    pub fn columns(&self) -> Option<&[String]> {
        self.results
            .iter()
            .find_map(|r| r.output.rows())
            .map(|rows| rows.columns.as_slice())
    }

    /// Rows of every shard, concatenated in topology order.
    pub fn rows(&self) -> impl Iterator<Item = &Vec<Value>> {
        self.results
            .iter()
            .filter_map(|r| r.output.rows())
            .flat_map(|rows| rows.rows.iter())
    }

    pub fn row_count(&self) -> usize {
        self.rows().count()
    }
}

/// Autocommit broadcast where some shards failed.
#[derive(Debug)]
pub struct BroadcastError {
    pub succeeded: Outcome,
    pub failures: Vec<ShardExecutionError>,
}

impl BroadcastError {
    pub fn first_error(&self) -> Option<&ShardExecutionError> {
        self.failures.first()
    }
}

impl fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "broadcast failed on {} of {} shards",
            self.failures.len(),
            self.failures.len() + self.succeeded.results.len()
        )?;
        if let Some(first) = self.first_error() {
            write!(f, ", first: {first}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BroadcastError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.first_error()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Shard(#[from] ShardExecutionError),
    #[error(transparent)]
    PartialBroadcast(#[from] BroadcastError),
}
