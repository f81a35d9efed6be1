//! # Partition service
//!
//! Owns, per partitioned region, the assignment of the region's logical
//! partitions to replica indices.
//!
//! Capacity shape for `P` partitions over `R` replicas: every replica holds
//! `P / R` partitions ("normal" capacity) and `P % R` of them hold one extra
//! ("over" capacity).
//!
//! Distributions are published as `Arc<PartitionDistribution>` and never
//! mutated; a rebalance builds a new value and replaces the stored handle.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::PartitionConfig;
use crate::error::{EngineError, EngineResult};
use crate::region::RegionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDistribution {
    region_id: RegionId,
    replica_count: usize,
    /// Replica index per partition id.
    assignment: Vec<usize>,
}

impl PartitionDistribution {
    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn partition_count(&self) -> usize {
        self.assignment.len()
    }

    pub fn replica_index(&self, partition_id: usize) -> usize {
        self.assignment[partition_id]
    }

    pub fn assignment(&self) -> &[usize] {
        &self.assignment
    }

    /// Partition ids owned by `replica_index`, ascending.
    pub fn partitions_of(&self, replica_index: usize) -> Vec<usize> {
        self.assignment
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == replica_index)
            .map(|(partition_id, _)| partition_id)
            .collect()
    }

    pub fn partition_counts_by_replica(&self) -> Vec<usize> {
        let mut counts = vec![0; self.replica_count];
        for &owner in &self.assignment {
            counts[owner] += 1;
        }
        counts
    }

    /// Checks the capacity shape.
    pub fn verify(&self) -> EngineResult<()> {
        let partition_count = self.partition_count();
        let normal = partition_count / self.replica_count;
        let over = partition_count % self.replica_count;
        if let Some(owner) = self.assignment.iter().find(|o| **o >= self.replica_count) {
            return Err(EngineError::InvariantViolation(format!(
                "region {} assigns a partition to replica {} of {}",
                self.region_id, owner, self.replica_count
            )));
        }
        let counts = self.partition_counts_by_replica();
        let over_count = counts.iter().filter(|c| **c == normal + 1).count();
        let shape_ok = counts.iter().all(|c| *c == normal || *c == normal + 1);
        if !shape_ok || over_count != over {
            return Err(EngineError::InvariantViolation(format!(
                "region {} has unbalanced partition counts {:?}",
                self.region_id, counts
            )));
        }
        Ok(())
    }
}

pub struct PartitionService {
    partition_count: usize,
    rng: StdRng,
    distributions: HashMap<RegionId, Arc<PartitionDistribution>>,
}

impl PartitionService {
    pub fn new(config: &PartitionConfig) -> Self {
        let rng = match config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            partition_count: config.partition_count,
            rng,
            distributions: HashMap::new(),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub fn get_partition_distribution(&self, region_id: RegionId) -> Option<Arc<PartitionDistribution>> {
        self.distributions.get(&region_id).cloned()
    }

    pub fn create_partition_distribution(
        &mut self,
        region_id: RegionId,
        replica_count: usize,
    ) -> EngineResult<Arc<PartitionDistribution>> {
        self.check_replica_count(replica_count)?;
        if self.distributions.contains_key(&region_id) {
            return Err(EngineError::illegal_state(format!(
                "partition distribution of region {} already exists",
                region_id
            )));
        }

        let mut assignment: Vec<usize> = (0..self.partition_count)
            .map(|partition_id| partition_id % replica_count)
            .collect();
        assignment.shuffle(&mut self.rng);

        let distribution = PartitionDistribution {
            region_id,
            replica_count,
            assignment,
        };
        distribution.verify()?;
        info!(
            region_id,
            replica_count,
            counts = ?distribution.partition_counts_by_replica(),
            "created partition distribution"
        );
        let distribution = Arc::new(distribution);
        self.distributions.insert(region_id, Arc::clone(&distribution));
        Ok(distribution)
    }

    /// Moves the minimum number of partitions so that `new_replica_count`
    /// replicas satisfy the capacity shape.
    pub fn rebalance_partition_distribution(
        &mut self,
        region_id: RegionId,
        new_replica_count: usize,
    ) -> EngineResult<Arc<PartitionDistribution>> {
        self.check_replica_count(new_replica_count)?;
        let Some(current) = self.distributions.get(&region_id).cloned() else {
            return Err(EngineError::illegal_argument(format!(
                "region {} has no partition distribution",
                region_id
            )));
        };
        let current_count = current.replica_count();
        if current_count == new_replica_count {
            return Ok(current);
        }

        let slot_count = current_count.max(new_replica_count);
        let mut owned: Vec<Vec<usize>> = vec![Vec::new(); slot_count];
        for (partition_id, &owner) in current.assignment().iter().enumerate() {
            owned[owner].push(partition_id);
        }
        // a source gives up its highest partition id first; the shuffle at
        // creation already spread ids randomly over replicas

        let (sources, destinations): (Vec<usize>, Vec<usize>) = if new_replica_count < current_count {
            ((new_replica_count..current_count).collect(), (0..new_replica_count).collect())
        } else {
            ((0..current_count).collect(), (current_count..new_replica_count).collect())
        };
        let normal = self.partition_count / new_replica_count;
        let shrinking = new_replica_count < current_count;

        let mut moves = 0;
        while !is_balanced(&owned, new_replica_count, normal, shrinking) {
            if moves >= self.partition_count {
                return Err(invariant(region_id, "rebalancing did not converge"));
            }
            let source = pick(&sources, &owned, |candidate, best| candidate > best);
            let Some(partition_id) = owned[source].pop() else {
                return Err(invariant(
                    region_id,
                    &format!("no partition left to move from replica {}", source),
                ));
            };
            let destination = pick(&destinations, &owned, |candidate, best| candidate < best);
            owned[destination].push(partition_id);
            if owned[destination].len() > normal + 1 {
                return Err(invariant(
                    region_id,
                    &format!("replica {} exceeds over capacity", destination),
                ));
            }
            debug!(region_id, partition_id, source, destination, "moved partition");
            moves += 1;
        }

        let mut assignment = vec![0; self.partition_count];
        for (replica_index, partitions) in owned.iter().enumerate() {
            for &partition_id in partitions {
                assignment[partition_id] = replica_index;
            }
        }
        let distribution = PartitionDistribution {
            region_id,
            replica_count: new_replica_count,
            assignment,
        };
        distribution.verify()?;
        info!(
            region_id,
            from = current_count,
            to = new_replica_count,
            moves,
            "rebalanced partition distribution"
        );
        let distribution = Arc::new(distribution);
        self.distributions.insert(region_id, Arc::clone(&distribution));
        Ok(distribution)
    }

    pub fn release_partition_distribution(&mut self, region_id: RegionId) -> Option<Arc<PartitionDistribution>> {
        self.distributions.remove(&region_id)
    }

    fn check_replica_count(&self, replica_count: usize) -> EngineResult<()> {
        if replica_count == 0 || replica_count > self.partition_count {
            return Err(EngineError::illegal_argument(format!(
                "replica count {} is outside [1, {}]",
                replica_count, self.partition_count
            )));
        }
        Ok(())
    }
}

/// First index in `candidates` whose load wins against every other under `better`.
fn pick(candidates: &[usize], owned: &[Vec<usize>], better: impl Fn(usize, usize) -> bool) -> usize {
    let mut best = candidates[0];
    for &candidate in &candidates[1..] {
        if better(owned[candidate].len(), owned[best].len()) {
            best = candidate;
        }
    }
    best
}

fn is_balanced(owned: &[Vec<usize>], replica_count: usize, normal: usize, shrinking: bool) -> bool {
    let kept_balanced = owned[..replica_count]
        .iter()
        .all(|p| p.len() == normal || p.len() == normal + 1);
    let removed_empty = !shrinking || owned[replica_count..].iter().all(Vec::is_empty);
    kept_balanced && removed_empty
}

fn invariant(region_id: RegionId, msg: &str) -> EngineError {
    EngineError::InvariantViolation(format!("region {}: {}", region_id, msg))
}

#[cfg(test)]
#[path = "tests/service_tests.rs"]
mod tests;
