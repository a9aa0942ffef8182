//! Physical connection capability implemented by per-engine drivers.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sharda_parser::Value;
use tokio_util::sync::CancellationToken;

pub mod memory;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Driver-level errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Database cannot be reached.
    #[error("database unavailable: {0}")]
    Unavailable(String),
    /// Statement rejected by the engine.
    #[error("statement rejected: {0}")]
    Rejected(String),
    /// Constraint violation.
    #[error("constraint violated: {0}")]
    Constraint(String),
    /// Operation observed a cancelled token.
    #[error("operation cancelled")]
    Cancelled,
    /// Local commit failed; the local transaction is rolled back.
    #[error("commit failed: {0}")]
    CommitFailed(String),
    /// Any other engine error.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

/// Result of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Output of one statement on one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutput {
    Rows(Rows),
    Exec(ExecResult),
}

impl StatementOutput {
    pub fn rows(&self) -> Option<&Rows> {
        match self {
            StatementOutput::Rows(r) => Some(r),
            StatementOutput::Exec(_) => None,
        }
    }

    pub fn exec(&self) -> Option<ExecResult> {
        match self {
            StatementOutput::Exec(e) => Some(*e),
            StatementOutput::Rows(_) => None,
        }
    }
}

/// A long-lived connection (or engine-side pool) to one database.
///
/// Implementations must be safe for concurrent use; callers share one
/// instance per shard.
#[async_trait]
pub trait PhysicalConnection: Send + Sync {
    /// Execute in autocommit mode.
    async fn execute(&self, sql: &str, args: &[Value]) -> Result<StatementOutput>;

    /// Open a local transaction.
    async fn begin(&self) -> Result<Box<dyn ShardTransaction>>;

    /// Prepare a statement. The handle honours `cancel` for its lifetime.
    async fn prepare(&self, sql: &str, cancel: &CancellationToken) -> Result<Box<dyn PreparedHandle>>;
}

/// A local transaction on one connection. Dropping it unfinished rolls back.
#[async_trait]
pub trait ShardTransaction: Send {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<StatementOutput>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A prepared statement bound to one connection.
#[async_trait]
pub trait PreparedHandle: Send + Sync {
    async fn execute(&self, args: &[Value]) -> Result<StatementOutput>;
}

/// Factory for connections of one engine.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name referenced by topology `driver:` fields.
    fn name(&self) -> &str;

    async fn connect(&self, dsn: &str) -> Result<Arc<dyn PhysicalConnection>>;
}

/// Drivers available to a process, keyed by name.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver; a later registration under the same name replaces it.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.drivers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;

    #[tokio::test]
    async fn registry_resolves_by_name() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(MemoryDriver::default()));
        assert!(registry.contains("memory"));
        assert!(registry.get("mysql").is_none());
        let conn = registry.get("memory").unwrap().connect("db").await.unwrap();
        let out = conn.execute("create table t (id integer primary key)", &[]).await.unwrap();
        assert_eq!(out.exec().unwrap().rows_affected, 0);
    }
}
