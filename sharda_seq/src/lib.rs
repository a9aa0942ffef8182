//! Globally unique id sequencer backed by a durable counter store.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sharda_driver::{DriverError, PhysicalConnection};
use sharda_parser::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Sequencer failures. None of them fall back to a locally generated id.
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("no sequencer store configured")]
    NotConfigured,
    #[error("sequencer store unavailable for {counter}: {source}")]
    Unavailable {
        counter: String,
        #[source]
        source: DriverError,
    },
    #[error("sequencer store returned no id for {0}")]
    MissingId(String),
    #[error("sequencer store went backwards for {counter}: {got} after {last}")]
    NonMonotonic { counter: String, last: u64, got: u64 },
    #[error("sequence {0} exhausted")]
    Exhausted(String),
}

/// Durable, atomically incremented counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `counter` and return the new value.
    async fn increment(&self, counter: &str) -> Result<u64, SequencerError>;
}

fn counter_table(counter: &str) -> String {
    let name: String = counter
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("sharda_seq_{name}")
}

/// Counter store using one autoincrement table per counter on a dedicated connection.
pub struct ConnectionCounterStore {
    conn: Arc<dyn PhysicalConnection>,
    ready: Mutex<HashSet<String>>,
}

impl ConnectionCounterStore {
    pub fn new(conn: Arc<dyn PhysicalConnection>) -> Self {
        Self {
            conn,
            ready: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_table(&self, counter: &str, table: &str) -> Result<(), SequencerError> {
        if self.ready.lock().unwrap().contains(table) {
            return Ok(());
        }
        let ddl = format!("CREATE TABLE IF NOT EXISTS {table} (id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT)");
        self.conn
            .execute(&ddl, &[])
            .await
            .map_err(|source| SequencerError::Unavailable {
                counter: counter.to_string(),
                source,
            })?;
        self.ready.lock().unwrap().insert(table.to_string());
        Ok(())
    }
}

#[async_trait]
impl CounterStore for ConnectionCounterStore {
    async fn increment(&self, counter: &str) -> Result<u64, SequencerError> {
        let table = counter_table(counter);
        self.ensure_table(counter, &table).await?;
        let out = self
            .conn
            .execute(&format!("INSERT INTO {table} (id) VALUES (NULL)"), &[])
            .await
            .map_err(|source| SequencerError::Unavailable {
                counter: counter.to_string(),
                source,
            })?;
        let id = out
            .exec()
            .and_then(|r| r.last_insert_id)
            .and_then(|id| u64::try_from(id).ok())
            .ok_or_else(|| SequencerError::MissingId(counter.to_string()))?;
        // The engine keeps the autoincrement high-water mark after older rows go.
        let prune = format!("DELETE FROM {table} WHERE id < ?");
        if let Err(e) = self.conn.execute(&prune, &[Value::Integer(id as i64)]).await {
            warn!(counter, error = %e, "sequencer prune failed");
        }
        Ok(id)
    }
}

/// Hands out strictly increasing ids per table.
pub struct Sequencer {
    store: Arc<dyn CounterStore>,
    counters: Mutex<HashMap<String, Arc<tokio::sync::Mutex<u64>>>>,
}

impl Sequencer {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, counter: &str) -> Arc<tokio::sync::Mutex<u64>> {
        self.counters
            .lock()
            .unwrap()
            .entry(counter.to_string())
            .or_default()
            .clone()
    }

    /// Next id for `table`. Increments of one table are serialised.
    #[instrument(skip(self))]
    pub async fn next(&self, table: &str) -> Result<u64, SequencerError> {
        let counter = table.to_ascii_lowercase();
        let slot = self.slot(&counter);
        let mut last = slot.lock().await;
        let id = self.store.increment(&counter).await?;
        if id <= *last {
            return Err(SequencerError::NonMonotonic {
                counter,
                last: *last,
                got: id,
            });
        }
        if id > i64::MAX as u64 {
            return Err(SequencerError::Exhausted(counter));
        }
        *last = id;
        debug!(id, "sequence allocated");
        Ok(id)
    }
}
