//! Region definitions and execution plans.
//!
//! A [`RegionDef`] is a run of operators sharing a statefulness class. A
//! [`RegionExecutionPlan`] cuts the region into pipelines (by start index)
//! and fixes its replica count. Plans are values: every reconfiguration
//! produces a new plan instead of editing the current one.

use std::sync::Arc;

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::flow::FlowDef;
use crate::operator::{OperatorDef, OperatorType};
use crate::pipeline::PipelineId;

use super::RegionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionType {
    Stateless,
    Stateful,
    PartitionedStateful,
}

impl From<OperatorType> for RegionType {
    fn from(operator_type: OperatorType) -> Self {
        match operator_type {
            OperatorType::Stateless => RegionType::Stateless,
            OperatorType::Stateful => RegionType::Stateful,
            OperatorType::PartitionedStateful => RegionType::PartitionedStateful,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegionDef {
    region_id: RegionId,
    region_type: RegionType,
    partition_field_names: Vec<String>,
    operators: Vec<Arc<OperatorDef>>,
}

impl RegionDef {
    pub fn new(
        region_id: RegionId,
        region_type: RegionType,
        partition_field_names: Vec<String>,
        operators: Vec<Arc<OperatorDef>>,
    ) -> Result<Self> {
        ensure!(!operators.is_empty(), "region {} has no operators", region_id);
        match region_type {
            RegionType::PartitionedStateful => ensure!(
                !partition_field_names.is_empty(),
                "partitioned region {} has no partition fields",
                region_id
            ),
            RegionType::Stateful => ensure!(
                operators.len() == 1,
                "stateful region {} must hold exactly one operator",
                region_id
            ),
            RegionType::Stateless => {}
        }
        if region_type != RegionType::PartitionedStateful && !partition_field_names.is_empty() {
            bail!("region {} is {:?} but declares partition fields", region_id, region_type);
        }
        Ok(Self {
            region_id,
            region_type,
            partition_field_names,
            operators,
        })
    }

    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    pub fn region_type(&self) -> RegionType {
        self.region_type
    }

    pub fn partition_field_names(&self) -> &[String] {
        &self.partition_field_names
    }

    pub fn operators(&self) -> &[Arc<OperatorDef>] {
        &self.operators
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    pub fn operator_index(&self, operator_id: &str) -> Option<usize> {
        self.operators.iter().position(|op| op.id == operator_id)
    }

    pub fn first_operator(&self) -> &Arc<OperatorDef> {
        &self.operators[0]
    }

    pub fn is_source(&self) -> bool {
        self.first_operator().is_source()
    }
}

/// Pipeline layout and replica count of one region.
#[derive(Debug, Clone)]
pub struct RegionExecutionPlan {
    region_def: Arc<RegionDef>,
    /// Sorted; always starts with 0.
    pipeline_start_indices: Vec<usize>,
    replica_count: usize,
}

impl RegionExecutionPlan {
    pub fn new(
        region_def: Arc<RegionDef>,
        replica_count: usize,
        pipeline_start_indices: Vec<usize>,
    ) -> Result<Self> {
        let region_id = region_def.region_id();
        ensure!(replica_count > 0, "region {} needs at least one replica", region_id);
        if region_def.region_type() == RegionType::Stateful {
            ensure!(
                replica_count == 1,
                "stateful region {} cannot have {} replicas",
                region_id,
                replica_count
            );
        }
        ensure!(
            pipeline_start_indices.first() == Some(&0),
            "first pipeline of region {} must start at 0: {:?}",
            region_id,
            pipeline_start_indices
        );
        ensure!(
            pipeline_start_indices.windows(2).all(|w| w[0] < w[1]),
            "pipeline start indices of region {} must be strictly increasing: {:?}",
            region_id,
            pipeline_start_indices
        );
        ensure!(
            pipeline_start_indices.iter().all(|&i| i < region_def.operator_count()),
            "pipeline start indices of region {} exceed its {} operators: {:?}",
            region_id,
            region_def.operator_count(),
            pipeline_start_indices
        );
        Ok(Self {
            region_def,
            pipeline_start_indices,
            replica_count,
        })
    }

    pub fn region_def(&self) -> &Arc<RegionDef> {
        &self.region_def
    }

    pub fn region_id(&self) -> RegionId {
        self.region_def.region_id()
    }

    pub fn region_type(&self) -> RegionType {
        self.region_def.region_type()
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn pipeline_start_indices(&self) -> &[usize] {
        &self.pipeline_start_indices
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipeline_start_indices.len()
    }

    pub fn pipeline_ids(&self) -> Vec<PipelineId> {
        self.pipeline_start_indices
            .iter()
            .map(|&start| PipelineId::new(self.region_id(), start))
            .collect()
    }

    /// Position of the pipeline starting at `start_index`.
    pub fn pipeline_index(&self, start_index: usize) -> Option<usize> {
        self.pipeline_start_indices.binary_search(&start_index).ok()
    }

    pub fn operator_count_by_pipeline_start_index(&self, start_index: usize) -> Option<usize> {
        let index = self.pipeline_index(start_index)?;
        let end = self
            .pipeline_start_indices
            .get(index + 1)
            .copied()
            .unwrap_or(self.region_def.operator_count());
        Some(end - start_index)
    }

    /// Operators of the pipeline starting at `start_index`.
    pub fn pipeline_operators(&self, start_index: usize) -> Option<&[Arc<OperatorDef>]> {
        let count = self.operator_count_by_pipeline_start_index(start_index)?;
        Some(&self.region_def.operators()[start_index..start_index + count])
    }

    /// Checks that `pipeline_ids` (sorted) are at least two contiguous
    /// pipelines of this region, and returns their start indices.
    pub fn mergeable_start_indices(&self, pipeline_ids: &[PipelineId]) -> EngineResult<Vec<usize>> {
        if pipeline_ids.len() < 2 {
            return Err(EngineError::illegal_argument(format!(
                "at least two pipelines are needed to merge: {:?}",
                pipeline_ids
            )));
        }
        if let Some(other) = pipeline_ids.iter().find(|id| id.region_id != self.region_id()) {
            return Err(EngineError::illegal_argument(format!(
                "pipeline {} is not in region {}",
                other,
                self.region_id()
            )));
        }
        let starts: Vec<usize> = pipeline_ids.iter().map(|id| id.pipeline_start_index).collect();
        let first = self.pipeline_index(starts[0]);
        let contiguous = first.is_some_and(|first| {
            starts
                .iter()
                .enumerate()
                .all(|(offset, &start)| self.pipeline_start_indices.get(first + offset) == Some(&start))
        });
        if !contiguous {
            return Err(EngineError::illegal_argument(format!(
                "pipelines {:?} are not contiguous in region {} with start indices {:?}",
                starts,
                self.region_id(),
                self.pipeline_start_indices
            )));
        }
        Ok(starts)
    }

    /// Checks operator indices, relative to the pipeline, at which
    /// `pipeline_id` is split. Returns the start indices of the resulting
    /// pipelines.
    pub fn split_start_indices(&self, pipeline_id: PipelineId, operator_indices: &[usize]) -> EngineResult<Vec<usize>> {
        let start = pipeline_id.pipeline_start_index;
        let operator_count = (pipeline_id.region_id == self.region_id())
            .then(|| self.operator_count_by_pipeline_start_index(start))
            .flatten()
            .ok_or_else(|| EngineError::illegal_argument(format!("pipeline {} is not in the plan", pipeline_id)))?;
        if operator_indices.is_empty() {
            return Err(EngineError::illegal_argument(format!(
                "no split index given for pipeline {}",
                pipeline_id
            )));
        }
        let mut previous = 0;
        for &index in operator_indices {
            if index <= previous || index >= operator_count {
                return Err(EngineError::illegal_argument(format!(
                    "invalid split indices {:?} for pipeline {} with {} operators",
                    operator_indices, pipeline_id, operator_count
                )));
            }
            previous = index;
        }
        let mut starts = vec![start];
        starts.extend(operator_indices.iter().map(|&i| start + i));
        Ok(starts)
    }

    /// Plan with the pipelines starting at `merged` (contiguous) fused into the first.
    pub fn with_merged(&self, merged: &[usize]) -> Result<Self> {
        let removed = &merged[1..];
        let indices = self
            .pipeline_start_indices
            .iter()
            .copied()
            .filter(|i| !removed.contains(i))
            .collect();
        Self::new(Arc::clone(&self.region_def), self.replica_count, indices)
    }

    /// Plan with additional pipelines starting at `split`.
    pub fn with_split(&self, split: &[usize]) -> Result<Self> {
        let mut indices = self.pipeline_start_indices.clone();
        indices.extend_from_slice(split);
        indices.sort_unstable();
        indices.dedup();
        Self::new(Arc::clone(&self.region_def), self.replica_count, indices)
    }

    pub fn with_replica_count(&self, replica_count: usize) -> Result<Self> {
        Self::new(
            Arc::clone(&self.region_def),
            replica_count,
            self.pipeline_start_indices.clone(),
        )
    }
}

/// Versioned snapshot of the whole topology.
#[derive(Debug, Clone)]
pub struct FlowExecutionPlan {
    version: u64,
    flow: Arc<FlowDef>,
    /// Sorted by region id.
    region_plans: Vec<RegionExecutionPlan>,
}

impl FlowExecutionPlan {
    pub fn new(version: u64, flow: Arc<FlowDef>, mut region_plans: Vec<RegionExecutionPlan>) -> Self {
        region_plans.sort_by_key(RegionExecutionPlan::region_id);
        Self {
            version,
            flow,
            region_plans,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn flow(&self) -> &Arc<FlowDef> {
        &self.flow
    }

    pub fn region_plans(&self) -> &[RegionExecutionPlan] {
        &self.region_plans
    }

    pub fn region_execution_plan(&self, region_id: RegionId) -> Option<&RegionExecutionPlan> {
        self.region_plans.iter().find(|plan| plan.region_id() == region_id)
    }

    /// Region holding `operator_id`.
    pub fn region_of(&self, operator_id: &str) -> Option<&RegionExecutionPlan> {
        self.region_plans
            .iter()
            .find(|plan| plan.region_def().operator_index(operator_id).is_some())
    }

    pub fn pipeline_ids(&self) -> Vec<PipelineId> {
        self.region_plans.iter().flat_map(RegionExecutionPlan::pipeline_ids).collect()
    }

    pub fn summary(&self) -> FlowExecutionPlanSummary {
        FlowExecutionPlanSummary {
            version: self.version,
            regions: self
                .region_plans
                .iter()
                .map(|plan| RegionSummary {
                    region_id: plan.region_id(),
                    region_type: plan.region_type(),
                    replica_count: plan.replica_count(),
                    pipelines: plan
                        .pipeline_start_indices()
                        .iter()
                        .map(|&start| {
                            plan.pipeline_operators(start)
                                .unwrap_or_default()
                                .iter()
                                .map(|op| op.id.clone())
                                .collect()
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Serializable view of a [`FlowExecutionPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowExecutionPlanSummary {
    pub version: u64,
    pub regions: Vec<RegionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSummary {
    pub region_id: RegionId,
    pub region_type: RegionType,
    pub replica_count: usize,
    /// Operator ids of each pipeline.
    pub pipelines: Vec<Vec<String>>,
}

#[cfg(test)]
#[path = "tests/def_tests.rs"]
mod tests;
