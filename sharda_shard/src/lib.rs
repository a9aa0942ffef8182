//! Query classification and shard resolution.
use sharda_parser::ParseError;
use sharda_seq::SequencerError;
use sharda_topology::ConfigError;
use thiserror::Error;

pub mod algorithm;
pub mod classify;
mod router;

pub use algorithm::{router_for, HashRouter, KeyError, ModuloRouter, RangeRouter, ShardRouter};
pub use classify::{classify, Classification, IdSlot};
pub use router::{DryRun, Route, RoutePlan, Router};

#[derive(Debug, Error)]
pub enum RouteError {
    /// Statement outside the supported dialect.
    #[error("unsupported query: {0}")]
    Parse(#[from] ParseError),
    #[error("unsupported query: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("table {table}: shard ordinal {ordinal} out of range for {shards} shards")]
    OutOfRange {
        table: String,
        ordinal: usize,
        shards: usize,
    },
    #[error("table {table}: {source}")]
    InvalidShardKey {
        table: String,
        #[source]
        source: KeyError,
    },
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
}

impl RouteError {
    /// Classifier could not handle the statement.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, RouteError::Parse(_) | RouteError::Unsupported(_))
    }

    /// Algorithm or topology mismatch for a concrete key.
    pub fn is_routing(&self) -> bool {
        matches!(self, RouteError::OutOfRange { .. } | RouteError::InvalidShardKey { .. })
    }
}
