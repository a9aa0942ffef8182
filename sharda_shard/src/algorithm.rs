//! Sharding algorithms mapping a shard-key value to a shard ordinal.
use crc32c::crc32c;
use sharda_parser::Value;
use sharda_topology::{Algorithm, RangeBound};
use thiserror::Error;

/// Why a key value could not be mapped to a shard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("shard key is NULL")]
    Null,
    #[error("shard key {0} is not an integer")]
    NotInteger(String),
    #[error("no range contains shard key {0}")]
    NoRange(i64),
}

/// Maps a key to a zero-based ordinal. The ordinal is not bounds-checked here.
pub trait ShardRouter: Send + Sync {
    fn shard_for_key(&self, key: &Value) -> Result<usize, KeyError>;
}

fn integer_key(key: &Value) -> Result<i64, KeyError> {
    match key {
        Value::Null => Err(KeyError::Null),
        other => other
            .as_i64()
            .ok_or_else(|| KeyError::NotInteger(other.to_string())),
    }
}

pub struct ModuloRouter {
    shards: usize,
}

impl ModuloRouter {
    pub fn new(shards: usize) -> Self {
        Self { shards }
    }
}

impl ShardRouter for ModuloRouter {
    fn shard_for_key(&self, key: &Value) -> Result<usize, KeyError> {
        let k = integer_key(key)?;
        Ok(k.rem_euclid(self.shards as i64) as usize)
    }
}

/// CRC32C over the canonical text of the key; `10` and `'10'` hash alike.
pub struct HashRouter {
    shards: usize,
}

impl HashRouter {
    pub fn new(shards: usize) -> Self {
        Self { shards }
    }
}

impl ShardRouter for HashRouter {
    fn shard_for_key(&self, key: &Value) -> Result<usize, KeyError> {
        let text = key.canonical_text().ok_or(KeyError::Null)?;
        Ok((crc32c(text.as_bytes()) as u64 % self.shards as u64) as usize)
    }
}

pub struct RangeRouter<'a> {
    ranges: &'a [RangeBound],
}

impl<'a> RangeRouter<'a> {
    pub fn new(ranges: &'a [RangeBound]) -> Self {
        Self { ranges }
    }
}

impl ShardRouter for RangeRouter<'_> {
    fn shard_for_key(&self, key: &Value) -> Result<usize, KeyError> {
        let k = integer_key(key)?;
        self.ranges
            .iter()
            .find(|r| k >= r.start && k < r.end)
            .map(|r| r.shard)
            .ok_or(KeyError::NoRange(k))
    }
}

/// Router implementing `algorithm` over a cluster of `shards` shards.
pub fn router_for(algorithm: &Algorithm, shards: usize) -> Box<dyn ShardRouter + '_> {
    match algorithm {
        Algorithm::Modulo => Box::new(ModuloRouter::new(shards)),
        Algorithm::Hash => Box::new(HashRouter::new(shards)),
        Algorithm::Range(ranges) => Box::new(RangeRouter::new(ranges)),
    }
}
