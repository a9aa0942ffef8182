//! In-memory engine for tests, demos and the interactive shell.
//!
//! Executes the dialect understood by `sharda_parser` with SQLite-like
//! integer primary keys. Transactions write through and keep an undo log, so
//! uncommitted writes are visible to other connections (read uncommitted).
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sharda_parser::{parse, Statement, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    Driver, DriverError, PhysicalConnection, PreparedHandle, Result, ShardTransaction,
    StatementOutput,
};

mod engine;

use engine::{State, Undo};

/// Driver handing out connections to named in-memory databases.
///
/// Connecting twice to the same DSN reaches the same database.
pub struct MemoryDriver {
    name: String,
    databases: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
    connects: AtomicUsize,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::with_name("memory")
    }
}

impl MemoryDriver {
    /// Driver registered under a custom name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            databases: Mutex::new(HashMap::new()),
            connects: AtomicUsize::new(0),
        }
    }

    /// Database behind `dsn`, created empty on first use.
    pub fn database(&self, dsn: &str) -> Arc<MemoryDatabase> {
        self.databases
            .lock()
            .unwrap()
            .entry(dsn.to_string())
            .or_insert_with(|| Arc::new(MemoryDatabase::new(dsn)))
            .clone()
    }

    /// Number of successful `connect` calls.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, dsn: &str) -> Result<Arc<dyn PhysicalConnection>> {
        let db = self.database(dsn);
        db.ensure_available()?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        debug!(dsn, "memory connection opened");
        Ok(Arc::new(MemoryConnection { db }))
    }
}

/// One in-memory database with fault injection switches.
pub struct MemoryDatabase {
    name: String,
    state: Mutex<State>,
    unavailable: AtomicBool,
    failing_commits: AtomicU32,
    failing_statements: AtomicU32,
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryDatabase {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State::default()),
            unavailable: AtomicBool::new(false),
            failing_commits: AtomicU32::new(0),
            failing_statements: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make the next local commit fail (and roll back).
    pub fn fail_next_commit(&self) {
        self.failing_commits.fetch_add(1, Ordering::SeqCst);
    }

    /// Make the next statement fail with `Rejected`.
    pub fn fail_next_statement(&self) {
        self.failing_statements.fetch_add(1, Ordering::SeqCst);
    }

    /// Simulate the database going away (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Row count of `table`, `None` if it does not exist.
    pub fn table_len(&self, table: &str) -> Option<usize> {
        self.state.lock().unwrap().table_len(table)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state.lock().unwrap().table_names()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DriverError::Unavailable(self.name.clone()));
        }
        Ok(())
    }

    fn run(&self, stmt: &Statement, args: &[Value], undo: Option<&mut Vec<Undo>>) -> Result<StatementOutput> {
        self.ensure_available()?;
        if take_fault(&self.failing_statements) {
            return Err(DriverError::Rejected("injected statement failure".into()));
        }
        self.state.lock().unwrap().execute(stmt, args, undo)
    }

    fn rollback(&self, log: Vec<Undo>) {
        if !log.is_empty() {
            self.state.lock().unwrap().undo(log);
        }
    }
}

fn parse_sql(sql: &str) -> Result<Statement> {
    parse(sql).map_err(|e| DriverError::Rejected(e.to_string()))
}

/// Connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    db: Arc<MemoryDatabase>,
}

#[async_trait]
impl PhysicalConnection for MemoryConnection {
    async fn execute(&self, sql: &str, args: &[Value]) -> Result<StatementOutput> {
        let stmt = parse_sql(sql)?;
        self.db.run(&stmt, args, None)
    }

    async fn begin(&self) -> Result<Box<dyn ShardTransaction>> {
        self.db.ensure_available()?;
        Ok(Box::new(MemoryTransaction {
            db: self.db.clone(),
            undo: Vec::new(),
            finished: false,
        }))
    }

    async fn prepare(&self, sql: &str, cancel: &CancellationToken) -> Result<Box<dyn PreparedHandle>> {
        if cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        self.db.ensure_available()?;
        let stmt = parse_sql(sql)?;
        Ok(Box::new(MemoryPrepared {
            db: self.db.clone(),
            stmt,
            cancel: cancel.clone(),
        }))
    }
}

struct MemoryTransaction {
    db: Arc<MemoryDatabase>,
    undo: Vec<Undo>,
    finished: bool,
}

#[async_trait]
impl ShardTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<StatementOutput> {
        let stmt = parse_sql(sql)?;
        self.db.run(&stmt, args, Some(&mut self.undo))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.finished = true;
        let undo = std::mem::take(&mut this.undo);
        if this.db.unavailable.load(Ordering::SeqCst) || take_fault(&this.db.failing_commits) {
            this.db.rollback(undo);
            return Err(DriverError::CommitFailed(format!(
                "{}: commit did not complete",
                this.db.name
            )));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.finished = true;
        let undo = std::mem::take(&mut this.undo);
        this.db.rollback(undo);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let undo = std::mem::take(&mut self.undo);
            self.db.rollback(undo);
        }
    }
}

struct MemoryPrepared {
    db: Arc<MemoryDatabase>,
    stmt: Statement,
    cancel: CancellationToken,
}

#[async_trait]
impl PreparedHandle for MemoryPrepared {
    async fn execute(&self, args: &[Value]) -> Result<StatementOutput> {
        if self.cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        self.db.run(&self.stmt, args, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (MemoryDriver, Arc<dyn PhysicalConnection>) {
        let driver = MemoryDriver::default();
        let conn = driver.connect("shard").await.unwrap();
        conn.execute("create table t (id integer primary key, v text)", &[])
            .await
            .unwrap();
        (driver, conn)
    }

    #[tokio::test]
    async fn same_dsn_shares_database() {
        let (driver, conn) = setup().await;
        let other = driver.connect("shard").await.unwrap();
        conn.execute("insert into t (v) values ('a')", &[]).await.unwrap();
        let out = other.execute("select v from t", &[]).await.unwrap();
        assert_eq!(out.rows().unwrap().rows.len(), 1);
        assert_eq!(driver.connect_count(), 2);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let (driver, conn) = setup().await;
        let mut tx = conn.begin().await.unwrap();
        tx.execute("insert into t (v) values ('a')", &[]).await.unwrap();
        assert_eq!(driver.database("shard").table_len("t"), Some(1));
        tx.rollback().await.unwrap();
        assert_eq!(driver.database("shard").table_len("t"), Some(0));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let (driver, conn) = setup().await;
        {
            let mut tx = conn.begin().await.unwrap();
            tx.execute("insert into t (v) values ('a')", &[]).await.unwrap();
        }
        assert_eq!(driver.database("shard").table_len("t"), Some(0));
    }

    #[tokio::test]
    async fn injected_commit_failure_rolls_back() {
        let (driver, conn) = setup().await;
        let db = driver.database("shard");
        db.fail_next_commit();
        let mut tx = conn.begin().await.unwrap();
        tx.execute("insert into t (v) values ('a')", &[]).await.unwrap();
        assert!(matches!(tx.commit().await, Err(DriverError::CommitFailed(_))));
        assert_eq!(db.table_len("t"), Some(0));

        let mut tx = conn.begin().await.unwrap();
        tx.execute("insert into t (v) values ('b')", &[]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(db.table_len("t"), Some(1));
    }

    #[tokio::test]
    async fn unavailable_database_refuses_work() {
        let (driver, conn) = setup().await;
        driver.database("shard").set_unavailable(true);
        assert!(matches!(
            conn.execute("select * from t", &[]).await,
            Err(DriverError::Unavailable(_))
        ));
        assert!(driver.connect("shard").await.is_err());
    }

    #[tokio::test]
    async fn prepared_handle_honours_cancellation() {
        let (_driver, conn) = setup().await;
        let token = CancellationToken::new();
        let stmt = conn.prepare("insert into t (v) values (?)", &token).await.unwrap();
        let out = stmt.execute(&[Value::from("x")]).await.unwrap();
        assert_eq!(out.exec().unwrap().last_insert_id, Some(1));
        token.cancel();
        assert!(matches!(stmt.execute(&[Value::from("y")]).await, Err(DriverError::Cancelled)));
        assert!(matches!(
            conn.prepare("select * from t", &token).await,
            Err(DriverError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn injected_statement_failure_is_one_shot() {
        let (driver, conn) = setup().await;
        driver.database("shard").fail_next_statement();
        assert!(conn.execute("select * from t", &[]).await.is_err());
        assert!(conn.execute("select * from t", &[]).await.is_ok());
    }
}
