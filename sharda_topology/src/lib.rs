//! Shard topology: clusters, shards and per-table sharding rules.
//!
//! A topology is loaded once from YAML, validated, and then shared read-only
//! (`Arc<ShardTopology>`) by every component.
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

mod config;

/// Topology loading and lookup errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Topology file could not be read.
    #[error("cannot read topology {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// Topology document is not valid YAML for the schema.
    #[error("invalid topology document: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("topology declares no clusters")]
    NoClusters,
    #[error("cluster {0} declared twice")]
    DuplicateCluster(String),
    #[error("cluster {0} has no shards")]
    EmptyCluster(String),
    #[error("shard name {0} used twice")]
    DuplicateShard(String),
    #[error("table {table} references unknown cluster {cluster}")]
    UnknownCluster { table: String, cluster: String },
    #[error("table {0} declared twice")]
    DuplicateTable(String),
    #[error("table {0} has a shard key but no algorithm")]
    ShardKeyWithoutAlgorithm(String),
    #[error("table {0} names an algorithm but no shard key")]
    AlgorithmWithoutShardKey(String),
    #[error("table {0} uses range sharding without ranges")]
    EmptyRanges(String),
    #[error("table {0} lists ranges but does not use range sharding")]
    RangesWithoutRangeAlgorithm(String),
    #[error("table {table} has empty range [{start}, {end})")]
    InvalidRange { table: String, start: i64, end: i64 },
    #[error("table {0} uses a sequencer but no sequencer store is configured")]
    MissingSequencerStore(String),
    /// No rule and no default rule for a table referenced at runtime.
    #[error("no sharding rule for table {0}")]
    UnknownTable(String),
    #[error("shard {shard} uses unregistered driver {driver}")]
    UnknownDriver { shard: String, driver: String },
}

/// Shard identity: cluster plus zero-based ordinal.
///
/// Ordering is topology order: cluster declaration order, then ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardId {
    pub cluster: Arc<str>,
    pub cluster_rank: usize,
    pub ordinal: usize,
}

impl Ord for ShardId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cluster_rank, self.ordinal).cmp(&(other.cluster_rank, other.ordinal))
    }
}

impl PartialOrd for ShardId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.ordinal)
    }
}

/// One physical database instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub id: ShardId,
    pub name: String,
    pub driver: String,
    pub dsn: String,
}

/// Connection descriptor of the sequencer counter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSpec {
    pub driver: String,
    pub dsn: String,
}

/// `[start, end)` key range owned by `shard`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeBound {
    pub start: i64,
    pub end: i64,
    pub shard: usize,
}

/// Shard selection algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Algorithm {
    /// Integer key modulo shard count.
    Modulo,
    /// CRC32C of the key modulo shard count.
    Hash,
    /// Explicit key ranges.
    Range(Vec<RangeBound>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerRule {
    /// Column receiving generated ids.
    pub column: String,
}

/// Routing rule for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingRule {
    pub table: String,
    pub cluster: String,
    /// `None` means the table lives entirely on `home_shard`.
    pub shard_key: Option<String>,
    pub algorithm: Algorithm,
    pub sequencer: Option<SequencerRule>,
    /// Designated shard ordinal for unsharded tables.
    pub home_shard: usize,
}

impl ShardingRule {
    pub fn is_sharded(&self) -> bool {
        self.shard_key.is_some()
    }

    /// Whether the generated id doubles as the shard key.
    pub fn shards_by_sequence(&self) -> bool {
        match (&self.shard_key, &self.sequencer) {
            (Some(key), Some(seq)) => key.eq_ignore_ascii_case(&seq.column),
            _ => false,
        }
    }

    pub fn is_shard_key(&self, column: &str) -> bool {
        self.shard_key
            .as_deref()
            .map_or(false, |k| k.eq_ignore_ascii_case(column))
    }
}

/// Immutable, validated topology.
#[derive(Debug)]
pub struct ShardTopology {
    clusters: Vec<(String, Vec<Shard>)>,
    tables: HashMap<String, ShardingRule>,
    default_rule: Option<(String, usize)>,
    sequencer: Option<StoreSpec>,
}

impl ShardTopology {
    /// Load and validate a YAML topology file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let topology = Self::from_yaml_str(&content)?;
        info!(
            path = %path.display(),
            clusters = topology.clusters.len(),
            tables = topology.tables.len(),
            "topology loaded"
        );
        Ok(topology)
    }

    /// Parse and validate a YAML topology document.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file: config::TopologyFile = serde_yaml::from_str(content)?;
        file.validate()
    }

    /// Rule for `table`: explicit, else the default rule, else `UnknownTable`.
    pub fn resolve_rule(&self, table: &str) -> Result<Cow<'_, ShardingRule>, ConfigError> {
        let key = table.to_ascii_lowercase();
        if let Some(rule) = self.tables.get(&key) {
            return Ok(Cow::Borrowed(rule));
        }
        match &self.default_rule {
            Some((cluster, shard)) => Ok(Cow::Owned(ShardingRule {
                table: key,
                cluster: cluster.clone(),
                shard_key: None,
                algorithm: Algorithm::Modulo,
                sequencer: None,
                home_shard: *shard,
            })),
            None => Err(ConfigError::UnknownTable(key)),
        }
    }

    /// Shards of `cluster` in configuration order.
    pub fn shards_in_order(&self, cluster: &str) -> Result<&[Shard], ConfigError> {
        self.clusters
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(cluster))
            .map(|(_, shards)| shards.as_slice())
            .ok_or_else(|| ConfigError::UnknownCluster {
                table: String::new(),
                cluster: cluster.to_string(),
            })
    }

    /// Every shard of every cluster, in topology order.
    pub fn all_shards(&self) -> impl Iterator<Item = &Shard> {
        self.clusters.iter().flat_map(|(_, shards)| shards.iter())
    }

    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.clusters.iter().map(|(name, _)| name.as_str())
    }

    /// Explicit rules, sorted by table name.
    pub fn rules(&self) -> Vec<&ShardingRule> {
        let mut rules: Vec<_> = self.tables.values().collect();
        rules.sort_by(|a, b| a.table.cmp(&b.table));
        rules
    }

    pub fn sequencer_store(&self) -> Option<&StoreSpec> {
        self.sequencer.as_ref()
    }
}
