//! # Partitioner
//!
//! Maps tuples to partition keys and partition keys to partition ids.
//! The partition id is stable for the lifetime of the process, so a sender and
//! the receiving queue always agree on where a key lives.

use std::hash::{Hash, Hasher};

use ahash::AHasher;
use anyhow::{Result, anyhow};

use crate::types::{PartitionKey, Tuple};

/// Extracts the partition key of a tuple from a fixed list of fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKeyExtractor {
    field_names: Vec<String>,
}

impl PartitionKeyExtractor {
    pub fn new(field_names: Vec<String>) -> Self {
        Self { field_names }
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    pub fn extract(&self, tuple: &Tuple) -> Result<PartitionKey> {
        self.field_names
            .iter()
            .map(|field| {
                tuple
                    .get(field)
                    .cloned()
                    .ok_or_else(|| anyhow!("tuple has no partition field {}", field))
            })
            .collect::<Result<Vec<_>>>()
            .map(PartitionKey)
    }

    /// Partition key and partition id of `tuple`.
    pub fn partition(&self, tuple: &Tuple, partition_count: usize) -> Result<(PartitionKey, usize)> {
        let key = self.extract(tuple)?;
        let partition_id = partition_id(&key, partition_count);
        Ok((key, partition_id))
    }
}

/// Partition id of `key` among `partition_count` partitions.
pub fn partition_id(key: &PartitionKey, partition_count: usize) -> usize {
    let mut hasher = AHasher::default();
    key.hash(&mut hasher);
    let hash = hasher.finish();
    (hash as usize) % partition_count
}

#[cfg(test)]
#[path = "tests/partitioner_tests.rs"]
mod tests;
