//! # Pipeline manager
//!
//! Owns every [`Pipeline`] of a flow and executes the flow lifecycle:
//!
//! ```text
//! INITIAL ──start──> RUNNING ──trigger_shutdown──> SHUTTING_DOWN ──all completed──> SHUT_DOWN
//!    │                  └──────────── replica failure / all completed ──────────────────┘
//!    └──start failed──> INITIALIZATION_FAILED
//! ```
//!
//! Reconfigurations (merge, split, rebalance) run only while `RUNNING`, only
//! against the current flow version, and only on pipelines whose runners are
//! all running. Each one stops the affected runners upstream-first, hands the
//! replicas to the [`RegionManager`], registers and wires the rebuilt
//! pipelines, starts them and bumps the flow version. A failure after the stop
//! is reported as a reconfiguration error and leaves the version unchanged.
//!
//! The manager is driven by a single control thread. Runners never call into
//! it directly: they read their wiring from the [`PipelineRegistry`] and their
//! notifications reach the manager through the control thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail, ensure};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::flow::FlowDef;
use crate::partition::PartitionKeyExtractor;
use crate::region::{FlowExecutionPlan, RegionExecutionPlan, RegionId, RegionManager, RegionType};
use crate::tuplequeue::FailureFlag;

use super::{
    ConnectionStatus, DownstreamSender, Pipeline, PipelineId, PipelineRegistry, PipelineReplica,
    PipelineReplicaId, PipelineWiring, ReplicaNotification, RunnablePipeline, SendPolicy, Supervisor,
    UpstreamContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowStatus {
    Initial,
    Running,
    ShuttingDown,
    ShutDown,
    InitializationFailed,
}

pub struct PipelineManager {
    config: EngineConfig,
    region_manager: RegionManager,
    registry: Arc<PipelineRegistry>,
    supervisor: Arc<dyn Supervisor>,
    policy: SendPolicy,
    flow: Option<Arc<FlowDef>>,
    status: FlowStatus,
    version: u64,
    region_plans: BTreeMap<RegionId, RegionExecutionPlan>,
    pipelines: BTreeMap<PipelineId, Pipeline>,
}

impl PipelineManager {
    pub fn new(config: EngineConfig, registry: Arc<PipelineRegistry>) -> Self {
        let policy = SendPolicy::new(FailureFlag::new(), config.queue.send_retry_interval());
        let supervisor: Arc<dyn Supervisor> = registry.clone();
        Self {
            region_manager: RegionManager::new(&config),
            config,
            registry,
            supervisor,
            policy,
            flow: None,
            status: FlowStatus::Initial,
            version: 0,
            region_plans: BTreeMap::new(),
            pipelines: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> FlowStatus {
        self.status
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn failure_flag(&self) -> &FailureFlag {
        &self.policy.failure
    }

    pub fn flow_execution_plan(&self) -> Option<FlowExecutionPlan> {
        let flow = self.flow.as_ref()?;
        Some(FlowExecutionPlan::new(
            self.version,
            Arc::clone(flow),
            self.region_plans.values().cloned().collect(),
        ))
    }

    fn current_plan(&self) -> EngineResult<FlowExecutionPlan> {
        self.flow_execution_plan()
            .ok_or_else(|| EngineError::illegal_state("no flow is started"))
    }

    /// Builds, wires and starts every pipeline of `plans`.
    pub fn start(&mut self, flow: Arc<FlowDef>, plans: Vec<RegionExecutionPlan>) -> EngineResult<FlowExecutionPlan> {
        if self.status != FlowStatus::Initial {
            return Err(EngineError::illegal_state(format!(
                "cannot start flow in status {:?}",
                self.status
            )));
        }
        self.flow = Some(Arc::clone(&flow));
        match self.try_start(&flow, plans) {
            Ok(()) => {
                self.status = FlowStatus::Running;
                self.version = 1;
                info!(
                    pipelines = self.pipelines.len(),
                    regions = self.region_plans.len(),
                    "flow started"
                );
                self.current_plan()
            }
            Err(err) => {
                error!(error = %format!("{:#}", err), "flow initialization failed");
                self.status = FlowStatus::InitializationFailed;
                self.policy.failure.set();
                self.release_all();
                Err(EngineError::initialization(&err))
            }
        }
    }

    fn try_start(&mut self, flow: &FlowDef, plans: Vec<RegionExecutionPlan>) -> Result<()> {
        for plan in plans {
            let region = self.region_manager.create_region(flow, plan)?;
            for (pipeline_id, replicas) in region.pipelines {
                let context = Arc::new(UpstreamContext::initial(0));
                self.add_pipeline(&region.plan, pipeline_id, replicas, context)?;
            }
            self.region_plans.insert(region.plan.region_id(), region.plan);
        }

        let ids: Vec<PipelineId> = self.pipelines.keys().copied().collect();
        for &id in &ids {
            let context = self.compute_upstream_context(flow, id)?;
            self.pipeline_mut(id)?.set_upstream_context(Arc::new(context));
        }
        for pipeline in self.pipelines.values_mut() {
            pipeline.init()?;
        }
        self.check_tuple_counts()?;
        for &id in &ids {
            let senders = self.create_downstream_senders(flow, id)?;
            self.pipeline(id)?.set_senders(senders);
        }
        for &id in &ids {
            self.start_pipeline(id)?;
        }
        Ok(())
    }

    fn check_tuple_counts(&self) -> Result<()> {
        let capacity = self.config.queue.tuple_queue_capacity;
        for pipeline in self.pipelines.values() {
            for (operator_id, strategy) in pipeline.operator_strategies() {
                let required = strategy
                    .tuple_availability()
                    .map_or(0, |availability| availability.max_tuple_count());
                ensure!(
                    required <= capacity,
                    "operator {} requires {} tuples per port but queues hold {}",
                    operator_id,
                    required,
                    capacity
                );
            }
        }
        Ok(())
    }

    /// Fuses contiguous pipelines of one region into one pipeline.
    pub fn merge_pipelines(
        &mut self,
        flow_version: u64,
        mut pipeline_ids: Vec<PipelineId>,
    ) -> EngineResult<FlowExecutionPlan> {
        pipeline_ids.sort_unstable();
        pipeline_ids.dedup();
        let flow = self.check_reconfiguration(flow_version, &pipeline_ids)?;
        self.region_manager.validate_pipeline_merge_parameters(&pipeline_ids)?;

        let upstream_context = self
            .pipelines
            .get(&pipeline_ids[0])
            .map(Pipeline::upstream_context)
            .ok_or_else(|| EngineError::illegal_argument(format!("pipeline {} does not exist", pipeline_ids[0])))?;
        info!(pipelines = ?pipeline_ids, "merging pipelines");
        self.try_merge(&flow, &pipeline_ids, upstream_context)
            .map_err(|err| self.reconfiguration_failed("merge pipelines", err))?;
        self.complete_reconfiguration()
    }

    fn try_merge(
        &mut self,
        flow: &FlowDef,
        pipeline_ids: &[PipelineId],
        upstream_context: Arc<UpstreamContext>,
    ) -> Result<()> {
        let released = self.release_pipelines(pipeline_ids)?;
        let (plan, replicas) = self.region_manager.merge_pipelines(flow, pipeline_ids, released)?;
        let merged_id = pipeline_ids[0];
        self.add_pipeline(&plan, merged_id, replicas, upstream_context)?;
        self.region_plans.insert(plan.region_id(), plan);
        let senders = self.create_downstream_senders(flow, merged_id)?;
        self.pipeline(merged_id)?.set_senders(senders);
        self.start_pipeline(merged_id)
    }

    /// Cuts a pipeline into several at `operator_indices`, relative to its
    /// first operator.
    pub fn split_pipeline(
        &mut self,
        flow_version: u64,
        pipeline_id: PipelineId,
        operator_indices: Vec<usize>,
    ) -> EngineResult<FlowExecutionPlan> {
        let flow = self.check_reconfiguration(flow_version, &[pipeline_id])?;
        self.region_manager
            .validate_pipeline_split_parameters(pipeline_id, &operator_indices)?;

        info!(%pipeline_id, indices = ?operator_indices, "splitting pipeline");
        self.try_split(&flow, pipeline_id, &operator_indices)
            .map_err(|err| self.reconfiguration_failed("split pipeline", err))?;
        self.complete_reconfiguration()
    }

    fn try_split(&mut self, flow: &FlowDef, pipeline_id: PipelineId, operator_indices: &[usize]) -> Result<()> {
        let released = self
            .release_pipelines(&[pipeline_id])?
            .pop()
            .ok_or_else(|| anyhow!("pipeline {} released no replicas", pipeline_id))?;
        let (plan, segments) = self
            .region_manager
            .split_pipeline(pipeline_id, operator_indices, released)?;

        let mut ids = Vec::with_capacity(segments.len());
        for (id, replicas) in segments {
            let context = replicas
                .first()
                .map(|replica| Arc::clone(replica.upstream_context()))
                .ok_or_else(|| anyhow!("pipeline {} has no replicas", id))?;
            self.add_pipeline(&plan, id, replicas, context)?;
            ids.push(id);
        }
        self.region_plans.insert(plan.region_id(), plan);
        // every segment is wired before any of them runs
        for &id in &ids {
            let senders = self.create_downstream_senders(flow, id)?;
            self.pipeline(id)?.set_senders(senders);
        }
        for &id in &ids {
            self.start_pipeline(id)?;
        }
        Ok(())
    }

    /// Changes the replica count of a partitioned region.
    pub fn rebalance_region(
        &mut self,
        flow_version: u64,
        region_id: RegionId,
        new_replica_count: usize,
    ) -> EngineResult<FlowExecutionPlan> {
        let plan = self
            .region_plans
            .get(&region_id)
            .ok_or_else(|| EngineError::illegal_argument(format!("region {} does not exist", region_id)))?;
        if plan.region_type() != RegionType::PartitionedStateful {
            return Err(EngineError::illegal_argument(format!(
                "region {} is {:?}, only partitioned regions can be rebalanced",
                region_id,
                plan.region_type()
            )));
        }
        let partition_count = self.region_manager.partition_service().partition_count();
        if new_replica_count == 0 || new_replica_count > partition_count {
            return Err(EngineError::illegal_argument(format!(
                "replica count {} is outside [1, {}]",
                new_replica_count, partition_count
            )));
        }
        if new_replica_count == plan.replica_count() {
            return Err(EngineError::illegal_argument(format!(
                "region {} already has {} replicas",
                region_id, new_replica_count
            )));
        }
        let region_pipelines = plan.pipeline_ids();
        let flow = self.check_reconfiguration(flow_version, &region_pipelines)?;
        let upstream_pipelines = self
            .upstream_pipeline_ids(&flow, region_id)
            .map_err(|err| EngineError::illegal_state(format!("{:#}", err)))?;

        info!(
            region_id,
            from = plan.replica_count(),
            to = new_replica_count,
            upstream = ?upstream_pipelines,
            "rebalancing region"
        );
        let timeout = self.config.manager.runner_command_timeout();
        for id in &upstream_pipelines {
            let Some(pipeline) = self.pipelines.get(id) else {
                continue;
            };
            if let Err(err) = pipeline.pause_runners(timeout) {
                self.resume_pipelines(&upstream_pipelines);
                return Err(err);
            }
        }
        let rebalanced = self.try_rebalance(
            &flow,
            region_id,
            new_replica_count,
            &region_pipelines,
            &upstream_pipelines,
        );
        let result = match rebalanced {
            Ok(()) => self.complete_reconfiguration(),
            Err(err) => {
                warn!(region_id, "resuming upstream pipelines after a failed rebalance");
                Err(self.reconfiguration_failed("rebalance region", err))
            }
        };
        // resumed runners re-read their wiring, so after a failure they see
        // whatever senders survived
        self.resume_pipelines(&upstream_pipelines);
        result
    }

    fn try_rebalance(
        &mut self,
        flow: &FlowDef,
        region_id: RegionId,
        new_replica_count: usize,
        region_pipelines: &[PipelineId],
        upstream_pipelines: &[PipelineId],
    ) -> Result<()> {
        let released = self.release_pipelines(region_pipelines)?;
        let released = region_pipelines.iter().copied().zip(released).collect();
        let region = self
            .region_manager
            .rebalance_region(flow, region_id, new_replica_count, released)?;

        for (id, replicas) in region.pipelines {
            let context = replicas
                .first()
                .map(|replica| Arc::clone(replica.upstream_context()))
                .ok_or_else(|| anyhow!("pipeline {} has no replicas", id))?;
            self.add_pipeline(&region.plan, id, replicas, context)?;
        }
        self.region_plans.insert(region_id, region.plan);
        for &id in region_pipelines.iter().chain(upstream_pipelines) {
            let senders = self.create_downstream_senders(flow, id)?;
            self.pipeline(id)?.set_senders(senders);
        }
        for &id in region_pipelines {
            self.start_pipeline(id)?;
        }
        Ok(())
    }

    fn resume_pipelines(&self, pipeline_ids: &[PipelineId]) {
        let timeout = self.config.manager.runner_command_timeout();
        for id in pipeline_ids {
            if let Some(pipeline) = self.pipelines.get(id) {
                if let Err(err) = pipeline.resume_runners(timeout) {
                    warn!(pipeline = %id, error = %err, "failed to resume pipeline");
                }
            }
        }
    }

    fn complete_reconfiguration(&mut self) -> EngineResult<FlowExecutionPlan> {
        self.version += 1;
        info!(version = self.version, "reconfiguration completed");
        self.current_plan()
    }

    fn reconfiguration_failed(&self, operation: &str, err: anyhow::Error) -> EngineError {
        error!(operation, version = self.version, error = %format!("{:#}", err), "reconfiguration failed");
        EngineError::reconfiguration(operation, &err)
    }

    fn check_reconfiguration(&self, flow_version: u64, pipeline_ids: &[PipelineId]) -> EngineResult<Arc<FlowDef>> {
        if flow_version != self.version {
            return Err(EngineError::illegal_argument(format!(
                "flow version {} does not match current version {}",
                flow_version, self.version
            )));
        }
        if self.status != FlowStatus::Running {
            return Err(EngineError::illegal_state(format!(
                "cannot reconfigure flow in status {:?}",
                self.status
            )));
        }
        if pipeline_ids.is_empty() {
            return Err(EngineError::illegal_argument("no pipelines given"));
        }
        for id in pipeline_ids {
            let pipeline = self
                .pipelines
                .get(id)
                .ok_or_else(|| EngineError::illegal_argument(format!("pipeline {} does not exist", id)))?;
            if !pipeline.is_fully_running() {
                return Err(EngineError::illegal_state(format!(
                    "pipeline {} is not running: {:?}",
                    id,
                    pipeline.runner_statuses()
                )));
            }
        }
        self.flow
            .clone()
            .ok_or_else(|| EngineError::illegal_state("no flow is started"))
    }

    /// Handles a runner's completion report. Once every replica of a pipeline
    /// completed, the pipelines it feeds get a new upstream context; once
    /// every pipeline completed, the flow shuts down.
    pub fn handle_pipeline_replica_completed(&mut self, id: PipelineReplicaId) {
        if !matches!(self.status, FlowStatus::Running | FlowStatus::ShuttingDown) {
            warn!(replica = %id, status = ?self.status, "ignoring completion");
            return;
        }
        let Some(pipeline) = self.pipelines.get_mut(&id.pipeline_id) else {
            warn!(replica = %id, "completion of unknown pipeline");
            return;
        };
        if !pipeline.handle_replica_completed(id.replica_index) {
            info!(replica = %id, "pipeline replica completed");
            return;
        }
        info!(pipeline = %id.pipeline_id, "pipeline completed");

        if let Err(err) = self.update_downstream_contexts(id.pipeline_id) {
            warn!(pipeline = %id.pipeline_id, error = %format!("{:#}", err), "failed to update downstream contexts");
        }
        if self.pipelines.values().all(Pipeline::is_completed) {
            info!("all pipelines completed");
            self.shutdown_gracefully(None);
        }
    }

    fn update_downstream_contexts(&mut self, pipeline_id: PipelineId) -> Result<()> {
        let flow = self.flow.clone().ok_or_else(|| anyhow!("no flow is started"))?;
        for downstream_id in self.downstream_pipeline_ids(&flow, pipeline_id)? {
            let next = self.compute_upstream_context(&flow, downstream_id)?;
            let pipeline = self.pipeline_mut(downstream_id)?;
            let current = pipeline.upstream_context();
            if current.statuses() == next.statuses() {
                continue;
            }
            let context = UpstreamContext::new(current.version() + 1, next.statuses().to_vec());
            info!(
                pipeline = %downstream_id,
                version = context.version(),
                statuses = ?context.statuses(),
                "updating upstream context"
            );
            pipeline.set_upstream_context(Arc::new(context));
            pipeline.update_runners();
        }
        Ok(())
    }

    /// Shuts the flow down after a runner failure.
    pub fn handle_pipeline_replica_failed(&mut self, id: PipelineReplicaId, err: anyhow::Error) {
        error!(replica = %id, error = %format!("{:#}", err), "pipeline replica failed");
        if self.status == FlowStatus::ShutDown {
            warn!(replica = %id, "flow is already shut down");
            return;
        }
        self.shutdown_gracefully(Some(&err));
    }

    pub fn handle_notification(&mut self, notification: ReplicaNotification) {
        match notification {
            ReplicaNotification::Completed(id) => self.handle_pipeline_replica_completed(id),
            ReplicaNotification::Failed(id, err) => self.handle_pipeline_replica_failed(id, err),
        }
    }

    /// Closes the upstream of every source pipeline so that completion
    /// cascades through the flow.
    pub fn trigger_shutdown(&mut self) -> EngineResult<()> {
        if self.status != FlowStatus::Running {
            return Err(EngineError::illegal_state(format!(
                "cannot trigger shutdown in status {:?}",
                self.status
            )));
        }
        info!("triggering shutdown");
        self.status = FlowStatus::ShuttingDown;
        let context = Arc::new(UpstreamContext::shutdown_source());
        for pipeline in self.pipelines.values_mut() {
            if pipeline.first_operator_def().is_source() {
                pipeline.set_upstream_context(Arc::clone(&context));
                pipeline.update_runners();
            }
        }
        Ok(())
    }

    /// Stops every runner and releases all pipelines and regions. With a
    /// `reason`, in-flight sends are failed fast first.
    pub fn shutdown_gracefully(&mut self, reason: Option<&anyhow::Error>) {
        if self.status == FlowStatus::ShutDown {
            return;
        }
        match reason {
            Some(reason) => {
                warn!(reason = %format!("{:#}", reason), "shutting down flow after failure");
                self.policy.failure.set();
            }
            None => info!("shutting down flow"),
        }
        self.status = FlowStatus::ShutDown;
        self.release_all();
        info!("flow shut down");
    }

    fn release_all(&mut self) {
        let timeout = self.config.manager.runner_command_timeout();
        for (id, pipeline) in self.pipelines.iter_mut() {
            if let Err(err) = pipeline.stop_runners(timeout) {
                warn!(pipeline = %id, error = %format!("{:#}", err), "failed to stop runners");
            }
            pipeline.shutdown_operators();
            self.registry.unregister(*id);
        }
        self.pipelines.clear();
        for &region_id in self.region_plans.keys() {
            self.region_manager.release_region(region_id);
        }
    }

    /// Stops the runners of `pipeline_ids` in order and takes their replicas.
    fn release_pipelines(&mut self, pipeline_ids: &[PipelineId]) -> Result<Vec<Vec<PipelineReplica>>> {
        let timeout = self.config.manager.runner_command_timeout();
        let mut released = Vec::with_capacity(pipeline_ids.len());
        for id in pipeline_ids {
            let mut pipeline = self
                .pipelines
                .remove(id)
                .ok_or_else(|| anyhow!("pipeline {} does not exist", id))?;
            self.registry.unregister(*id);
            pipeline.stop_runners(timeout)?;
            released.push(pipeline.take_replicas());
        }
        Ok(released)
    }

    fn add_pipeline(
        &mut self,
        plan: &RegionExecutionPlan,
        id: PipelineId,
        replicas: Vec<PipelineReplica>,
        upstream_context: Arc<UpstreamContext>,
    ) -> Result<()> {
        let operators = plan
            .pipeline_operators(id.pipeline_start_index)
            .ok_or_else(|| anyhow!("pipeline {} is not in the plan of region {}", id, plan.region_id()))?
            .to_vec();
        let wiring = self
            .registry
            .register(id, PipelineWiring::new(Arc::clone(&upstream_context), Vec::new()));
        let mut pipeline = Pipeline::new(id, operators, replicas, wiring)?;
        pipeline.set_upstream_context(upstream_context);
        self.pipelines.insert(id, pipeline);
        Ok(())
    }

    fn start_pipeline(&mut self, id: PipelineId) -> Result<()> {
        let supervisor = Arc::clone(&self.supervisor);
        let config = self.config.runner.clone();
        self.pipeline_mut(id)?.start_runners(&supervisor, &config)
    }

    fn pipeline(&self, id: PipelineId) -> Result<&Pipeline> {
        self.pipelines
            .get(&id)
            .ok_or_else(|| anyhow!("pipeline {} does not exist", id))
    }

    fn pipeline_mut(&mut self, id: PipelineId) -> Result<&mut Pipeline> {
        self.pipelines
            .get_mut(&id)
            .ok_or_else(|| anyhow!("pipeline {} does not exist", id))
    }

    fn pipeline_of_operator(&self, operator_id: &str) -> Option<&Pipeline> {
        self.pipelines
            .values()
            .find(|pipeline| pipeline.operator_index(operator_id).is_some())
    }

    fn pipeline_starting_with(&self, operator_id: &str) -> Result<&Pipeline> {
        self.pipelines
            .values()
            .find(|pipeline| pipeline.first_operator_def().id == operator_id)
            .ok_or_else(|| anyhow!("operator {} does not start a pipeline", operator_id))
    }

    /// Pipelines fed by the last operator of `pipeline_id`.
    fn downstream_pipeline_ids(&self, flow: &FlowDef, pipeline_id: PipelineId) -> Result<Vec<PipelineId>> {
        let last = self.pipeline(pipeline_id)?.last_operator_def();
        flow.downstream_operators(&last.id)
            .into_iter()
            .map(|operator_id| Ok(self.pipeline_starting_with(operator_id)?.id()))
            .collect()
    }

    /// Pipelines outside `region_id` that feed its first operator.
    fn upstream_pipeline_ids(&self, flow: &FlowDef, region_id: RegionId) -> Result<Vec<PipelineId>> {
        let plan = self
            .region_plans
            .get(&region_id)
            .ok_or_else(|| anyhow!("region {} does not exist", region_id))?;
        let first = plan.region_def().first_operator();
        let mut ids: Vec<PipelineId> = flow
            .upstream_operators(&first.id)
            .into_iter()
            .filter_map(|operator_id| self.pipeline_of_operator(operator_id))
            .map(Pipeline::id)
            .filter(|id| id.region_id != region_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Upstream context of `pipeline_id` derived from the flow topology: a
    /// port is active while some pipeline feeding it has not completed.
    fn compute_upstream_context(&self, flow: &FlowDef, pipeline_id: PipelineId) -> Result<UpstreamContext> {
        let first = self.pipeline(pipeline_id)?.first_operator_def();
        if first.is_source() {
            return Ok(UpstreamContext::initial(0));
        }
        let inbound = flow.inbound_connections(&first.id);
        let mut statuses = Vec::with_capacity(first.input_port_count);
        for port in 0..first.input_port_count {
            let mut status = ConnectionStatus::Closed;
            for connection in inbound.iter().filter(|c| c.target.port == port) {
                let upstream_operator = &connection.source.operator_id;
                let Some(upstream) = self.pipeline_of_operator(upstream_operator) else {
                    continue;
                };
                if upstream.last_operator_def().id != *upstream_operator {
                    bail!(
                        "operator {} feeds {} but is not the last operator of {}",
                        upstream_operator,
                        first.id,
                        upstream.id()
                    );
                }
                if !upstream.is_completed() {
                    status = ConnectionStatus::Active;
                }
            }
            statuses.push(status);
        }
        Ok(UpstreamContext::new(0, statuses))
    }

    /// One downstream sender per replica of `pipeline_id`.
    fn create_downstream_senders(&self, flow: &FlowDef, pipeline_id: PipelineId) -> Result<Vec<Arc<DownstreamSender>>> {
        let pipeline = self.pipeline(pipeline_id)?;
        let last = pipeline.last_operator_def();
        let replica_count = pipeline.replica_count();
        let downstream = flow.downstream_operators(&last.id);

        let mut senders = Vec::with_capacity(replica_count);
        for replica_index in 0..replica_count {
            let mut per_operator = Vec::with_capacity(downstream.len());
            for &operator_id in &downstream {
                let ports = flow.port_pairs(&last.id, operator_id);
                let target = self.pipeline_starting_with(operator_id)?;
                let target_region = target.id().region_id;
                let target_plan = self
                    .region_plans
                    .get(&target_region)
                    .ok_or_else(|| anyhow!("region {} does not exist", target_region))?;
                let inboxes = target.inbox_senders();
                let direct = |index: usize| -> Result<DownstreamSender> {
                    let target_inbox = inboxes
                        .get(index)
                        .ok_or_else(|| anyhow!("pipeline {} has no replica {}", target.id(), index))?;
                    Ok(DownstreamSender::Direct {
                        ports: ports.clone(),
                        target: target_inbox.clone(),
                        policy: self.policy.clone(),
                    })
                };

                let sender = if target_region == pipeline_id.region_id {
                    direct(replica_index)?
                } else {
                    match target_plan.region_type() {
                        RegionType::PartitionedStateful => {
                            let distribution = self
                                .region_manager
                                .partition_distribution(target_region)
                                .ok_or_else(|| anyhow!("region {} has no partition distribution", target_region))?;
                            ensure!(
                                distribution.replica_count() == inboxes.len(),
                                "distribution of region {} has {} replicas but pipeline {} has {}",
                                target_region,
                                distribution.replica_count(),
                                target.id(),
                                inboxes.len()
                            );
                            DownstreamSender::Partitioned {
                                ports: ports.clone(),
                                targets: inboxes.to_vec(),
                                distribution,
                                extractor: PartitionKeyExtractor::new(
                                    target_plan.region_def().partition_field_names().to_vec(),
                                ),
                                policy: self.policy.clone(),
                            }
                        }
                        RegionType::Stateless if inboxes.len() == replica_count => direct(replica_index)?,
                        RegionType::Stateless if inboxes.len() == 1 => direct(0)?,
                        RegionType::Stateless => bail!(
                            "pipeline {} with {} replicas cannot feed stateless pipeline {} with {}",
                            pipeline_id,
                            replica_count,
                            target.id(),
                            inboxes.len()
                        ),
                        RegionType::Stateful => {
                            ensure!(
                                inboxes.len() == 1,
                                "stateful pipeline {} has {} replicas",
                                target.id(),
                                inboxes.len()
                            );
                            direct(0)?
                        }
                    }
                };
                per_operator.push(sender);
            }
            senders.push(Arc::new(DownstreamSender::compose(per_operator)));
        }
        Ok(senders)
    }
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "tests/manager_tests.rs"]
mod tests;
