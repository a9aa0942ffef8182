//! On-disk topology document and its validation into runtime types.
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::{
    Algorithm, ConfigError, RangeBound, SequencerRule, Shard, ShardId, ShardTopology,
    ShardingRule, StoreSpec,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TopologyFile {
    clusters: Vec<ClusterFile>,
    #[serde(default)]
    sequencer: Option<StoreFile>,
    #[serde(default)]
    default: Option<DefaultRuleFile>,
    #[serde(default)]
    tables: BTreeMap<String, TableFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClusterFile {
    name: String,
    shards: Vec<ShardFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShardFile {
    #[serde(default)]
    name: Option<String>,
    driver: String,
    dsn: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreFile {
    driver: String,
    dsn: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultRuleFile {
    cluster: String,
    #[serde(default)]
    shard: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AlgorithmFile {
    Modulo,
    Hash,
    Range,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableFile {
    cluster: String,
    #[serde(default)]
    shard_key: Option<String>,
    #[serde(default)]
    algorithm: Option<AlgorithmFile>,
    #[serde(default)]
    ranges: Vec<RangeBound>,
    #[serde(default)]
    sequencer: Option<SequencerFile>,
    #[serde(default)]
    shard: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SequencerFile {
    column: String,
}

impl TopologyFile {
    pub(crate) fn validate(self) -> Result<ShardTopology, ConfigError> {
        if self.clusters.is_empty() {
            return Err(ConfigError::NoClusters);
        }
        let mut clusters: Vec<(String, Vec<Shard>)> = Vec::with_capacity(self.clusters.len());
        let mut shard_names = HashSet::new();
        for (rank, cluster) in self.clusters.into_iter().enumerate() {
            let name = cluster.name.to_ascii_lowercase();
            if clusters.iter().any(|(n, _)| *n == name) {
                return Err(ConfigError::DuplicateCluster(name));
            }
            if cluster.shards.is_empty() {
                return Err(ConfigError::EmptyCluster(name));
            }
            let cluster_name: Arc<str> = Arc::from(name.as_str());
            let mut shards = Vec::with_capacity(cluster.shards.len());
            for (ordinal, shard) in cluster.shards.into_iter().enumerate() {
                let shard_name = shard
                    .name
                    .unwrap_or_else(|| format!("{name}_{ordinal}"));
                if !shard_names.insert(shard_name.clone()) {
                    return Err(ConfigError::DuplicateShard(shard_name));
                }
                shards.push(Shard {
                    id: ShardId {
                        cluster: cluster_name.clone(),
                        cluster_rank: rank,
                        ordinal,
                    },
                    name: shard_name,
                    driver: shard.driver,
                    dsn: shard.dsn,
                });
            }
            clusters.push((name, shards));
        }

        let known = |cluster: &str| clusters.iter().any(|(n, _)| n == cluster);

        let mut tables = HashMap::with_capacity(self.tables.len());
        for (table, spec) in self.tables {
            let table = table.to_ascii_lowercase();
            let cluster = spec.cluster.to_ascii_lowercase();
            if !known(&cluster) {
                return Err(ConfigError::UnknownCluster {
                    table: table.clone(),
                    cluster,
                });
            }
            let shard_key = spec.shard_key.map(|k| k.to_ascii_lowercase());
            if !matches!(spec.algorithm, Some(AlgorithmFile::Range)) && !spec.ranges.is_empty() {
                return Err(ConfigError::RangesWithoutRangeAlgorithm(table));
            }
            let algorithm = match (&shard_key, spec.algorithm) {
                (None, Some(_)) => return Err(ConfigError::AlgorithmWithoutShardKey(table)),
                (Some(_), None) => return Err(ConfigError::ShardKeyWithoutAlgorithm(table)),
                (None, None) | (Some(_), Some(AlgorithmFile::Modulo)) => Algorithm::Modulo,
                (Some(_), Some(AlgorithmFile::Hash)) => Algorithm::Hash,
                (Some(_), Some(AlgorithmFile::Range)) => {
                    if spec.ranges.is_empty() {
                        return Err(ConfigError::EmptyRanges(table));
                    }
                    if let Some(bad) = spec.ranges.iter().find(|r| r.start >= r.end) {
                        return Err(ConfigError::InvalidRange {
                            table,
                            start: bad.start,
                            end: bad.end,
                        });
                    }
                    Algorithm::Range(spec.ranges)
                }
            };
            let sequencer = spec.sequencer.map(|s| SequencerRule {
                column: s.column.to_ascii_lowercase(),
            });
            if sequencer.is_some() && self.sequencer.is_none() {
                return Err(ConfigError::MissingSequencerStore(table));
            }
            let rule = ShardingRule {
                table: table.clone(),
                cluster,
                shard_key,
                algorithm,
                sequencer,
                home_shard: spec.shard,
            };
            // Keys differing only in case collide after lowercasing.
            if tables.insert(table.clone(), rule).is_some() {
                return Err(ConfigError::DuplicateTable(table));
            }
        }

        let default_rule = match self.default {
            Some(d) => {
                let cluster = d.cluster.to_ascii_lowercase();
                if !known(&cluster) {
                    return Err(ConfigError::UnknownCluster {
                        table: "default".into(),
                        cluster,
                    });
                }
                Some((cluster, d.shard))
            }
            None => None,
        };

        Ok(ShardTopology {
            clusters,
            tables,
            default_rule,
            sequencer: self.sequencer.map(|s| StoreSpec {
                driver: s.driver,
                dsn: s.dsn,
            }),
        })
    }
}
