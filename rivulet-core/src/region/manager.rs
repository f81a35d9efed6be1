//! # Region manager
//!
//! Materializes region execution plans into pipeline replicas and performs
//! the structural half of every reconfiguration. The pipeline manager stops
//! the affected runners and hands their replicas over; the region manager
//! rebuilds them for the new plan and returns them ready to be started.
//!
//! Operator replicas are moved, never recreated, across merge and split, so
//! their inboxes, queues and state survive. Rebalancing creates or drops
//! whole pipeline replicas and moves partition state between them.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::AHashMap;
use anyhow::{Context, Result, anyhow, ensure};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::flow::FlowDef;
use crate::operator::{KvStore, OperatorDef};
use crate::partition::{PartitionDistribution, PartitionKeyExtractor, PartitionService};
use crate::pipeline::{
    OperatorReplica, PipelineId, PipelineReplica, PipelineReplicaId, PortLinks, RunnablePipeline,
    UpstreamContext, chained_context,
};
use crate::tuplequeue::{OperatorQueue, TupleBatch, TupleQueueContainer};
use crate::types::{PartitionKey, Tuple};

use super::{RegionExecutionPlan, RegionId, RegionType};

/// Replicas of every pipeline of one region, indexed by replica index.
#[derive(Debug)]
pub struct Region {
    pub plan: RegionExecutionPlan,
    pub pipelines: Vec<(PipelineId, Vec<PipelineReplica>)>,
}

pub struct RegionManager {
    partition_service: PartitionService,
    inbox_capacity: usize,
    plans: HashMap<RegionId, RegionExecutionPlan>,
}

impl RegionManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            partition_service: PartitionService::new(&config.partition),
            inbox_capacity: config.queue.tuple_queue_capacity,
            plans: HashMap::new(),
        }
    }

    pub fn partition_service(&self) -> &PartitionService {
        &self.partition_service
    }

    pub fn region_execution_plan(&self, region_id: RegionId) -> Option<&RegionExecutionPlan> {
        self.plans.get(&region_id)
    }

    pub fn partition_distribution(&self, region_id: RegionId) -> Option<Arc<PartitionDistribution>> {
        self.partition_service.get_partition_distribution(region_id)
    }

    /// Creates the replicas of every pipeline of `plan`. Operator replicas are
    /// left uninitialized.
    pub fn create_region(&mut self, flow: &FlowDef, plan: RegionExecutionPlan) -> Result<Region> {
        let region_id = plan.region_id();
        ensure!(!self.plans.contains_key(&region_id), "region {} already exists", region_id);

        let distribution = match plan.region_type() {
            RegionType::PartitionedStateful => Some(
                self.partition_service
                    .create_partition_distribution(region_id, plan.replica_count())?,
            ),
            RegionType::Stateless | RegionType::Stateful => None,
        };

        let mut pipelines = Vec::with_capacity(plan.pipeline_count());
        for pipeline_id in plan.pipeline_ids() {
            let operators = plan
                .pipeline_operators(pipeline_id.pipeline_start_index)
                .ok_or_else(|| anyhow!("pipeline {} is not in the plan", pipeline_id))?;
            let mut replicas = Vec::with_capacity(plan.replica_count());
            for replica_index in 0..plan.replica_count() {
                replicas.push(self.create_pipeline_replica(
                    flow,
                    PipelineReplicaId::new(pipeline_id, replica_index),
                    operators,
                    distribution.as_deref(),
                )?);
            }
            pipelines.push((pipeline_id, replicas));
        }

        info!(
            region_id,
            region_type = ?plan.region_type(),
            replicas = plan.replica_count(),
            pipelines = plan.pipeline_count(),
            "created region"
        );
        self.plans.insert(region_id, plan.clone());
        Ok(Region { plan, pipelines })
    }

    fn create_pipeline_replica(
        &self,
        flow: &FlowDef,
        id: PipelineReplicaId,
        operators: &[Arc<OperatorDef>],
        distribution: Option<&PartitionDistribution>,
    ) -> Result<PipelineReplica> {
        let replicas = operators
            .iter()
            .map(|def| OperatorReplica::new(Arc::clone(def), id.replica_index, distribution, self.inbox_capacity))
            .collect::<Result<Vec<_>>>()?;
        let links = operators
            .windows(2)
            .map(|pair| flow.port_pairs(&pair[0].id, &pair[1].id))
            .collect();
        let context = UpstreamContext::initial(operators[0].input_port_count);
        PipelineReplica::new(id, replicas, links, Arc::new(context))
    }

    fn plan(&self, region_id: RegionId) -> EngineResult<&RegionExecutionPlan> {
        self.plans
            .get(&region_id)
            .ok_or_else(|| EngineError::illegal_argument(format!("region {} does not exist", region_id)))
    }

    /// Start indices of the pipelines to merge. `pipeline_ids` must be sorted.
    pub fn validate_pipeline_merge_parameters(&self, pipeline_ids: &[PipelineId]) -> EngineResult<Vec<usize>> {
        let region_id = pipeline_ids
            .first()
            .map(|id| id.region_id)
            .ok_or_else(|| EngineError::illegal_argument("no pipelines to merge"))?;
        self.plan(region_id)?.mergeable_start_indices(pipeline_ids)
    }

    /// Start indices of the pipelines a split of `pipeline_id` produces.
    pub fn validate_pipeline_split_parameters(
        &self,
        pipeline_id: PipelineId,
        operator_indices: &[usize],
    ) -> EngineResult<Vec<usize>> {
        self.plan(pipeline_id.region_id)?
            .split_start_indices(pipeline_id, operator_indices)
    }

    /// Fuses the stopped replicas of contiguous pipelines `pipeline_ids`.
    ///
    /// `released[k][r]` is replica `r` of `pipeline_ids[k]`. The merged
    /// pipeline keeps the id and upstream context of the first one.
    pub fn merge_pipelines(
        &mut self,
        flow: &FlowDef,
        pipeline_ids: &[PipelineId],
        released: Vec<Vec<PipelineReplica>>,
    ) -> Result<(RegionExecutionPlan, Vec<PipelineReplica>)> {
        let starts = self.validate_pipeline_merge_parameters(pipeline_ids)?;
        let plan = self.plan(pipeline_ids[0].region_id)?;
        ensure!(
            released.len() == pipeline_ids.len(),
            "merging {} pipelines but got replicas of {}",
            pipeline_ids.len(),
            released.len()
        );
        let replica_count = plan.replica_count();
        ensure!(
            released.iter().all(|replicas| replicas.len() == replica_count),
            "every merged pipeline needs {} replicas",
            replica_count
        );
        let new_plan = plan.with_merged(&starts)?;
        let merged_id = pipeline_ids[0];

        let mut by_pipeline: Vec<_> = released.into_iter().map(Vec::into_iter).collect();
        let mut merged = Vec::with_capacity(replica_count);
        for replica_index in 0..replica_count {
            let mut operators: Vec<OperatorReplica> = Vec::new();
            let mut links: Vec<PortLinks> = Vec::new();
            let mut context = None;
            for (position, replicas) in by_pipeline.iter_mut().enumerate() {
                let replica = replicas
                    .next()
                    .ok_or_else(|| anyhow!("missing replica {} of pipeline {}", replica_index, pipeline_ids[position]))?;
                let (mut pipeline_operators, pipeline_links, pipeline_context) = replica.into_parts();
                if position == 0 {
                    context = Some(pipeline_context);
                } else if let Some(last) = operators.last() {
                    links.push(flow.port_pairs(last.operator_id(), pipeline_operators[0].operator_id()));
                    pipeline_operators[0].absorb_inbox()?;
                }
                operators.extend(pipeline_operators);
                links.extend(pipeline_links);
            }
            let context = context.ok_or_else(|| anyhow!("no pipelines to merge"))?;
            merged.push(PipelineReplica::new(
                PipelineReplicaId::new(merged_id, replica_index),
                operators,
                links,
                context,
            )?);
        }

        info!(region_id = merged_id.region_id, ?starts, "merged pipelines");
        self.plans.insert(merged_id.region_id, new_plan.clone());
        Ok((new_plan, merged))
    }

    /// Cuts the stopped replicas of `pipeline_id` at `operator_indices`
    /// (relative to the pipeline).
    ///
    /// The first resulting pipeline keeps the upstream context of the split
    /// one; the others start with a context derived from their predecessor
    /// operator.
    pub fn split_pipeline(
        &mut self,
        pipeline_id: PipelineId,
        operator_indices: &[usize],
        released: Vec<PipelineReplica>,
    ) -> Result<(RegionExecutionPlan, Vec<(PipelineId, Vec<PipelineReplica>)>)> {
        let starts = self.validate_pipeline_split_parameters(pipeline_id, operator_indices)?;
        let plan = self.plan(pipeline_id.region_id)?;
        ensure!(
            released.len() == plan.replica_count(),
            "splitting pipeline {} needs {} replicas, got {}",
            pipeline_id,
            plan.replica_count(),
            released.len()
        );
        let new_plan = plan.with_split(&starts[1..])?;
        let new_ids: Vec<PipelineId> = starts
            .iter()
            .map(|&start| PipelineId::new(pipeline_id.region_id, start))
            .collect();

        let mut split: Vec<(PipelineId, Vec<PipelineReplica>)> =
            new_ids.iter().map(|&id| (id, Vec::new())).collect();
        for (replica_index, replica) in released.into_iter().enumerate() {
            let (operators, links, context) = replica.into_parts();
            let mut operators = operators.into_iter();
            let mut links = links.into_iter();
            let mut previous_status = None;
            for (segment, &start) in starts.iter().enumerate() {
                let end = starts.get(segment + 1).copied();
                let count = end.map_or(usize::MAX, |end| end - start);
                let segment_operators: Vec<OperatorReplica> = operators.by_ref().take(count).collect();
                let segment_links: Vec<PortLinks> = links
                    .by_ref()
                    .take(segment_operators.len().saturating_sub(1))
                    .collect();
                if end.is_some() {
                    // the link crossing into the next segment
                    links.next();
                }
                let first = segment_operators
                    .first()
                    .ok_or_else(|| anyhow!("empty segment {} of pipeline {}", segment, pipeline_id))?;
                let segment_context = match previous_status {
                    None => Arc::clone(&context),
                    Some(status) => Arc::new(chained_context(status, first.def().input_port_count)),
                };
                previous_status = segment_operators.last().map(OperatorReplica::status);
                split[segment].1.push(PipelineReplica::new(
                    PipelineReplicaId::new(new_ids[segment], replica_index),
                    segment_operators,
                    segment_links,
                    segment_context,
                )?);
            }
        }

        info!(%pipeline_id, ?starts, "split pipeline");
        self.plans.insert(pipeline_id.region_id, new_plan.clone());
        Ok((new_plan, split))
    }

    /// Changes the replica count of a partitioned region.
    ///
    /// `released` holds the stopped replicas of every pipeline of the region,
    /// in plan order. Partition state and buffered tuples move to the replica
    /// that owns their partition under the new distribution.
    pub fn rebalance_region(
        &mut self,
        flow: &FlowDef,
        region_id: RegionId,
        new_replica_count: usize,
        released: Vec<(PipelineId, Vec<PipelineReplica>)>,
    ) -> Result<Region> {
        let plan = self.plan(region_id)?.clone();
        ensure!(
            plan.region_type() == RegionType::PartitionedStateful,
            "region {} is not partitioned",
            region_id
        );
        let current = self
            .partition_service
            .get_partition_distribution(region_id)
            .ok_or_else(|| anyhow!("region {} has no partition distribution", region_id))?;
        let distribution = self
            .partition_service
            .rebalance_partition_distribution(region_id, new_replica_count)?;
        let extractor = PartitionKeyExtractor::new(plan.region_def().partition_field_names().to_vec());

        let mut pipelines = Vec::with_capacity(released.len());
        for (pipeline_id, mut replicas) in released {
            ensure!(
                replicas.len() == current.replica_count(),
                "pipeline {} has {} replicas but the region has {}",
                pipeline_id,
                replicas.len(),
                current.replica_count()
            );
            let operators = plan
                .pipeline_operators(pipeline_id.pipeline_start_index)
                .ok_or_else(|| anyhow!("pipeline {} is not in the plan", pipeline_id))?;
            let context = Arc::clone(replicas[0].upstream_context());
            for replica_index in replicas.len()..new_replica_count {
                // built against the current distribution, the replica owns no partitions yet
                let mut replica = self.create_pipeline_replica(
                    flow,
                    PipelineReplicaId::new(pipeline_id, replica_index),
                    operators,
                    Some(&current),
                )?;
                replica.set_upstream_context(Arc::clone(&context));
                replica.init()?;
                replicas.push(replica);
            }
            let mut removed = replicas.split_off(new_replica_count);

            for operator_index in 0..operators.len() {
                redistribute(operator_index, &mut replicas, &mut removed, &distribution, &extractor)
                    .with_context(|| format!("redistributing operator {}", operators[operator_index].id))?;
            }
            for replica in &mut removed {
                debug!(replica = %replica.id(), "dropping replica");
                replica.shutdown_operators()?;
            }
            pipelines.push((pipeline_id, replicas));
        }

        let new_plan = plan.with_replica_count(new_replica_count)?;
        info!(
            region_id,
            from = current.replica_count(),
            to = new_replica_count,
            "rebalanced region"
        );
        self.plans.insert(region_id, new_plan.clone());
        Ok(Region {
            plan: new_plan,
            pipelines,
        })
    }

    /// Forgets the plan and partition distribution of `region_id`.
    pub fn release_region(&mut self, region_id: RegionId) -> Option<RegionExecutionPlan> {
        self.partition_service.release_partition_distribution(region_id);
        self.plans.remove(&region_id)
    }
}

/// Moves the input and state of operator `operator_index` of every replica to
/// the owner of each partition under `distribution`.
fn redistribute(
    operator_index: usize,
    kept: &mut [PipelineReplica],
    removed: &mut [PipelineReplica],
    distribution: &PartitionDistribution,
    extractor: &PartitionKeyExtractor,
) -> Result<()> {
    let partitioned = matches!(
        kept[0].operators()[operator_index].queue(),
        OperatorQueue::Partitioned(_)
    );
    if partitioned {
        let mut containers: HashMap<usize, TupleQueueContainer> = HashMap::new();
        let mut stores: HashMap<usize, AHashMap<PartitionKey, KvStore>> = HashMap::new();
        for replica in kept.iter_mut().chain(removed.iter_mut()) {
            let (taken_containers, taken_stores) = replica.operators_mut()[operator_index].take_partitions()?;
            containers.extend(taken_containers.into_iter().map(|c| (c.partition_id(), c)));
            stores.extend(taken_stores);
        }
        for partition_id in 0..distribution.partition_count() {
            let owner = distribution.replica_index(partition_id);
            kept[owner].operators_mut()[operator_index].install_partition(
                containers.remove(&partition_id),
                stores.remove(&partition_id),
                partition_id,
            )?;
        }
    } else {
        let mut batches: Vec<TupleBatch> = Vec::new();
        for replica in kept.iter_mut().chain(removed.iter_mut()) {
            batches.extend(replica.operators_mut()[operator_index].take_buffered()?);
        }
        for TupleBatch { port, tuples } in batches {
            let mut routed: Vec<Vec<Tuple>> = vec![Vec::new(); kept.len()];
            for tuple in tuples {
                let (_, partition_id) = extractor.partition(&tuple, distribution.partition_count())?;
                routed[distribution.replica_index(partition_id)].push(tuple);
            }
            for (owner, tuples) in routed.into_iter().enumerate() {
                if !tuples.is_empty() {
                    kept[owner].operators_mut()[operator_index].offer(port, tuples)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/manager_tests.rs"]
mod tests;
