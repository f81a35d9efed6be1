use serde::{Deserialize, Serialize};

use crate::region::RegionId;

/// Identifies a pipeline: the region it belongs to and the index of its first
/// operator within the region's operator sequence.
///
/// Format: `pipeline_{region}_{start_index}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipelineId {
    pub region_id: RegionId,
    pub pipeline_start_index: usize,
}

impl PipelineId {
    pub fn new(region_id: RegionId, pipeline_start_index: usize) -> Self {
        Self {
            region_id,
            pipeline_start_index,
        }
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipeline_{}_{}", self.region_id, self.pipeline_start_index)
    }
}

/// One runnable instance of a pipeline.
///
/// Format: `pipeline_{region}_{start_index}_r{replica}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipelineReplicaId {
    pub pipeline_id: PipelineId,
    pub replica_index: usize,
}

impl PipelineReplicaId {
    pub fn new(pipeline_id: PipelineId, replica_index: usize) -> Self {
        Self {
            pipeline_id,
            replica_index,
        }
    }
}

impl std::fmt::Display for PipelineReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_r{}", self.pipeline_id, self.replica_index)
    }
}
