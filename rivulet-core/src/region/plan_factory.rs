//! Builds the initial execution plan of every region.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use super::{RegionDef, RegionExecutionPlan, RegionType};

/// Produces initial region plans from fixed settings.
///
/// Partitioned regions get `replica_count` replicas, every other region one.
/// With `split_pipelines`, regions of two or more operators are cut at their
/// middle operator into two pipelines.
#[derive(Debug, Clone)]
pub struct StaticRegionExecutionPlanFactory {
    replica_count: usize,
    split_pipelines: bool,
}

impl StaticRegionExecutionPlanFactory {
    pub fn new(replica_count: usize) -> Self {
        Self {
            replica_count,
            split_pipelines: false,
        }
    }

    pub fn with_pipeline_split(mut self, split_pipelines: bool) -> Self {
        self.split_pipelines = split_pipelines;
        self
    }

    pub fn create_region_execution_plans(&self, regions: Vec<RegionDef>) -> Result<Vec<RegionExecutionPlan>> {
        regions
            .into_iter()
            .map(|region| self.create_region_execution_plan(Arc::new(region)))
            .collect()
    }

    pub fn create_region_execution_plan(&self, region: Arc<RegionDef>) -> Result<RegionExecutionPlan> {
        let replica_count = match region.region_type() {
            RegionType::PartitionedStateful => self.replica_count,
            RegionType::Stateless | RegionType::Stateful => 1,
        };
        let operator_count = region.operator_count();
        let start_indices = if self.split_pipelines && operator_count > 1 {
            vec![0, operator_count / 2]
        } else {
            vec![0]
        };
        debug!(
            region_id = region.region_id(),
            replica_count,
            ?start_indices,
            "created region execution plan"
        );
        RegionExecutionPlan::new(region, replica_count, start_indices)
    }
}

#[cfg(test)]
#[path = "tests/plan_factory_tests.rs"]
mod tests;
