//! # Operator replica
//!
//! One replica of one operator: the user [`Operator`] instance, its input
//! queue, its key-value state and its inbox.
//!
//! ```text
//! INITIAL ──init──> RUNNING ──upstream no longer invokable──> COMPLETING ──queues empty──> COMPLETED
//!                      └──────────── source closed by shutdown ─────────────────────────────┘
//! ```
//!
//! While COMPLETING with some upstream ports still open, the replica drains
//! with one tuple on any open port; once every port is closed it flushes its
//! queues greedily and completes when they are empty.

use std::sync::Arc;

use ahash::AHashMap;
use anyhow::{Result, anyhow, bail, ensure};
use tracing::{debug, info};

use crate::operator::{
    InitContext, InvocationContext, InvocationReason, KvStore, Operator, OperatorDef, OperatorType,
    SchedulingStrategy, TupleAvailability, TupleAvailabilityByCount, TupleAvailabilityByPort,
};
use crate::partition::{PartitionDistribution, PartitionKeyExtractor};
use crate::tuplequeue::{
    DefaultOperatorQueue, GreedyDrainer, Inbox, InboxSender, OperatorQueue, PartitionedOperatorQueue,
    TupleBatch, TupleCountDrainer, TupleQueueContainer, TupleQueueDrainer,
};
use crate::types::{PartitionKey, Tuple, Tuples};

use super::UpstreamContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorReplicaStatus {
    Initial,
    Running,
    Completing,
    Completed,
}

/// Key-value stores of one partition, keyed by partition key.
pub type PartitionStores = (usize, AHashMap<PartitionKey, KvStore>);

/// Key-value state of an operator replica.
#[derive(Debug)]
pub enum OperatorKvState {
    Stateless,
    Single(KvStore),
    /// Indexed by partition id; stores keyed by partition key.
    Partitioned(Vec<Option<AHashMap<PartitionKey, KvStore>>>),
}

impl OperatorKvState {
    pub fn for_operator(def: &OperatorDef, partition_count: usize) -> Self {
        match def.operator_type {
            OperatorType::Stateless => OperatorKvState::Stateless,
            OperatorType::Stateful => OperatorKvState::Single(KvStore::new()),
            OperatorType::PartitionedStateful => {
                OperatorKvState::Partitioned((0..partition_count).map(|_| None).collect())
            }
        }
    }

    /// Removes the stores of every partition.
    pub fn take_partitions(&mut self) -> Vec<PartitionStores> {
        match self {
            OperatorKvState::Partitioned(partitions) => partitions
                .iter_mut()
                .enumerate()
                .filter_map(|(partition_id, stores)| stores.take().map(|s| (partition_id, s)))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn install_partition(
        &mut self,
        partition_id: usize,
        stores: AHashMap<PartitionKey, KvStore>,
    ) -> Result<()> {
        let OperatorKvState::Partitioned(partitions) = self else {
            bail!("partition state installed into non-partitioned operator");
        };
        let slot = partitions
            .get_mut(partition_id)
            .ok_or_else(|| anyhow!("partition {} is out of range", partition_id))?;
        ensure!(slot.is_none(), "partition {} state is already present", partition_id);
        *slot = Some(stores);
        Ok(())
    }

    /// Store of `key`, if one was created.
    pub fn partition_store(&self, partition_id: usize, key: &PartitionKey) -> Option<&KvStore> {
        match self {
            OperatorKvState::Partitioned(partitions) => partitions
                .get(partition_id)
                .and_then(Option::as_ref)
                .and_then(|stores| stores.get(key)),
            _ => None,
        }
    }
}

pub struct OperatorReplica {
    def: Arc<OperatorDef>,
    replica_index: usize,
    operator: Box<dyn Operator>,
    status: OperatorReplicaStatus,
    queue: OperatorQueue,
    state: OperatorKvState,
    inbox: Inbox,
    initial_strategy: Option<SchedulingStrategy>,
    drainer: Box<dyn TupleQueueDrainer + Send>,
    upstream_context: Arc<UpstreamContext>,
}

impl OperatorReplica {
    /// New replica in `INITIAL` status.
    ///
    /// Partitioned operators need the region's `distribution`; the replica
    /// gets a container for every partition assigned to `replica_index`.
    pub fn new(
        def: Arc<OperatorDef>,
        replica_index: usize,
        distribution: Option<&PartitionDistribution>,
        inbox_capacity: usize,
    ) -> Result<Self> {
        let (queue, partition_count) = if def.is_partitioned() {
            let distribution = distribution.ok_or_else(|| {
                anyhow!("partitioned operator {} needs a partition distribution", def.id)
            })?;
            let queue = PartitionedOperatorQueue::new(
                def.id.clone(),
                def.input_port_count,
                PartitionKeyExtractor::new(def.partition_field_names.clone()),
                distribution.partition_count(),
                &distribution.partitions_of(replica_index),
            );
            (OperatorQueue::Partitioned(queue), distribution.partition_count())
        } else {
            let queue = DefaultOperatorQueue::new(def.id.clone(), def.input_port_count);
            (OperatorQueue::Default(queue), 0)
        };
        let state = OperatorKvState::for_operator(&def, partition_count);
        let mut replica = Self {
            operator: def.create_operator(),
            replica_index,
            status: OperatorReplicaStatus::Initial,
            queue,
            state,
            inbox: Inbox::new(inbox_capacity),
            initial_strategy: None,
            drainer: Box::new(GreedyDrainer::new(def.input_port_count)),
            upstream_context: Arc::new(UpstreamContext::initial(def.input_port_count)),
            def,
        };
        if let OperatorKvState::Partitioned(stores) = &mut replica.state {
            if let OperatorQueue::Partitioned(queue) = &replica.queue {
                for partition_id in queue.owned_partitions() {
                    stores[partition_id] = Some(AHashMap::new());
                }
            }
        }
        Ok(replica)
    }

    pub fn def(&self) -> &Arc<OperatorDef> {
        &self.def
    }

    pub fn operator_id(&self) -> &str {
        &self.def.id
    }

    pub fn replica_index(&self) -> usize {
        self.replica_index
    }

    pub fn status(&self) -> OperatorReplicaStatus {
        self.status
    }

    pub fn initial_strategy(&self) -> Option<&SchedulingStrategy> {
        self.initial_strategy.as_ref()
    }

    pub fn upstream_context(&self) -> &Arc<UpstreamContext> {
        &self.upstream_context
    }

    pub fn inbox_sender(&self) -> InboxSender {
        self.inbox.sender()
    }

    pub fn queue(&self) -> &OperatorQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut OperatorQueue {
        &mut self.queue
    }

    pub fn state(&self) -> &OperatorKvState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut OperatorKvState {
        &mut self.state
    }

    /// Initializes the operator and applies its scheduling strategy.
    pub fn init(&mut self, upstream_context: Arc<UpstreamContext>) -> Result<SchedulingStrategy> {
        ensure!(
            self.status == OperatorReplicaStatus::Initial,
            "operator {} replica {} is already initialized",
            self.def.id,
            self.replica_index
        );
        let ctx = InitContext {
            operator_id: &self.def.id,
            replica_index: self.replica_index,
            input_port_count: self.def.input_port_count,
            output_port_count: self.def.output_port_count,
            partition_field_names: &self.def.partition_field_names,
            upstream_context: &upstream_context,
        };
        let strategy = self.operator.init(&ctx)?;
        self.validate_strategy(&strategy)?;
        if let Some(availability) = strategy.tuple_availability() {
            self.apply_availability(availability.clone())?;
        }
        self.initial_strategy = Some(strategy.clone());
        self.status = OperatorReplicaStatus::Running;
        debug!(
            operator = %self.def.id,
            replica = self.replica_index,
            ?strategy,
            "initialized operator replica"
        );
        self.handle_upstream_context(upstream_context)?;
        Ok(strategy)
    }

    fn validate_strategy(&self, strategy: &SchedulingStrategy) -> Result<()> {
        match strategy {
            SchedulingStrategy::WhenAvailable => ensure!(
                self.def.input_port_count == 0,
                "operator {} has input ports but schedules when available",
                self.def.id
            ),
            SchedulingStrategy::WhenTuplesAvailable(availability) => {
                ensure!(
                    availability.port_count() == self.def.input_port_count,
                    "operator {} declares tuple counts for {} ports but has {}",
                    self.def.id,
                    availability.port_count(),
                    self.def.input_port_count
                );
                ensure!(
                    availability.max_tuple_count() > 0,
                    "operator {} requires no tuples on any port",
                    self.def.id
                );
            }
        }
        Ok(())
    }

    fn apply_availability(&mut self, availability: TupleAvailability) -> Result<()> {
        self.queue
            .set_tuple_counts(&availability.tuple_counts, availability.by_port)?;
        self.drainer = Box::new(TupleCountDrainer::new(availability));
        Ok(())
    }

    /// Moves every batch waiting in the inbox into the operator queue.
    pub fn absorb_inbox(&mut self) -> Result<()> {
        for TupleBatch { port, tuples } in self.inbox.drain() {
            self.queue.offer(port, tuples)?;
        }
        Ok(())
    }

    pub fn offer(&mut self, port: usize, tuples: Vec<Tuple>) -> Result<()> {
        self.queue.offer(port, tuples)
    }

    /// Reacts to a new upstream context, moving to COMPLETING or COMPLETED if
    /// the initial strategy can no longer be satisfied.
    pub fn handle_upstream_context(&mut self, upstream_context: Arc<UpstreamContext>) -> Result<()> {
        self.upstream_context = upstream_context;
        match self.status {
            OperatorReplicaStatus::Running => {
                let Some(strategy) = &self.initial_strategy else {
                    return Ok(());
                };
                if self.upstream_context.is_invokable(&self.def, strategy) {
                    return Ok(());
                }
                if self.def.is_source() {
                    info!(operator = %self.def.id, replica = self.replica_index, "source completed");
                    self.status = OperatorReplicaStatus::Completed;
                    return Ok(());
                }
                info!(operator = %self.def.id, replica = self.replica_index, "operator completing");
                self.status = OperatorReplicaStatus::Completing;
                self.apply_completion_strategy()
            }
            OperatorReplicaStatus::Completing => self.apply_completion_strategy(),
            OperatorReplicaStatus::Initial | OperatorReplicaStatus::Completed => Ok(()),
        }
    }

    fn apply_completion_strategy(&mut self) -> Result<()> {
        if self.upstream_context.is_active_connection_present() {
            let tuple_counts: Vec<usize> = (0..self.def.input_port_count)
                .map(|port| usize::from(self.upstream_context.connection_status(port).is_active()))
                .collect();
            self.apply_availability(TupleAvailability {
                by_port: TupleAvailabilityByPort::AnyPort,
                by_count: TupleAvailabilityByCount::AtLeast,
                tuple_counts,
            })
        } else {
            self.drainer = Box::new(GreedyDrainer::new(self.def.input_port_count));
            Ok(())
        }
    }

    /// Runs one invocation round with `upstream_context` as the latest view of
    /// this operator's upstream. Returns the produced output, if any.
    pub fn invoke(&mut self, upstream_context: &Arc<UpstreamContext>) -> Result<Option<Tuples>> {
        if matches!(
            self.status,
            OperatorReplicaStatus::Initial | OperatorReplicaStatus::Completed
        ) {
            return Ok(None);
        }
        self.absorb_inbox()?;
        if **upstream_context != *self.upstream_context {
            self.handle_upstream_context(Arc::clone(upstream_context))?;
        }

        let output = match self.status {
            OperatorReplicaStatus::Running => {
                if self.def.is_source() {
                    self.invoke_source()?
                } else {
                    self.invoke_operator(InvocationReason::Success)?
                }
            }
            OperatorReplicaStatus::Completing => {
                let reason = if self.upstream_context.is_active_connection_present() {
                    InvocationReason::InputPortClosed
                } else {
                    InvocationReason::ShutdownRequested
                };
                let output = self.invoke_operator(reason)?;
                if reason == InvocationReason::ShutdownRequested
                    && self.queue.is_empty()
                    && self.inbox.is_empty()
                {
                    info!(operator = %self.def.id, replica = self.replica_index, "operator completed");
                    self.status = OperatorReplicaStatus::Completed;
                }
                output
            }
            OperatorReplicaStatus::Initial | OperatorReplicaStatus::Completed => Tuples::default(),
        };
        Ok((!output.is_empty()).then_some(output))
    }

    fn invoke_source(&mut self) -> Result<Tuples> {
        let mut output = Tuples::new(self.def.output_port_count);
        let kv = match &mut self.state {
            OperatorKvState::Single(kv) => Some(kv),
            _ => None,
        };
        let mut ctx = InvocationContext {
            reason: InvocationReason::Success,
            input: Tuples::new(0),
            output: &mut output,
            partition_key: None,
            kv,
        };
        self.operator.invoke(&mut ctx)?;
        Ok(output)
    }

    fn invoke_operator(&mut self, reason: InvocationReason) -> Result<Tuples> {
        let mut output = Tuples::new(self.def.output_port_count);
        let Self {
            operator,
            queue,
            state,
            drainer,
            def,
            ..
        } = self;
        match queue {
            OperatorQueue::Default(queue) => {
                if let Some(input) = queue.drain(drainer.as_mut()) {
                    let kv = match state {
                        OperatorKvState::Single(kv) => Some(kv),
                        _ => None,
                    };
                    let mut ctx = InvocationContext {
                        reason,
                        input,
                        output: &mut output,
                        partition_key: None,
                        kv,
                    };
                    operator.invoke(&mut ctx)?;
                }
            }
            OperatorQueue::Partitioned(queue) => {
                let OperatorKvState::Partitioned(partitions) = state else {
                    bail!("partitioned operator {} has no partitioned state", def.id);
                };
                queue.drain_each(drainer.as_mut(), |partition_id, key, input| {
                    let store = partitions[partition_id]
                        .get_or_insert_with(AHashMap::new)
                        .entry(key.clone())
                        .or_default();
                    let mut ctx = InvocationContext {
                        reason,
                        input,
                        output: &mut output,
                        partition_key: Some(&key),
                        kv: Some(store),
                    };
                    operator.invoke(&mut ctx)
                })?;
            }
        }
        Ok(output)
    }

    /// Moves the containers and partition state this replica owns out of it.
    pub fn take_partitions(&mut self) -> Result<(Vec<TupleQueueContainer>, Vec<PartitionStores>)> {
        self.absorb_inbox()?;
        let OperatorQueue::Partitioned(queue) = &mut self.queue else {
            bail!("operator {} is not partitioned", self.def.id);
        };
        Ok((queue.take_containers(), self.state.take_partitions()))
    }

    /// Takes ownership of one partition's buffered input and state.
    pub fn install_partition(
        &mut self,
        container: Option<TupleQueueContainer>,
        stores: Option<AHashMap<PartitionKey, KvStore>>,
        partition_id: usize,
    ) -> Result<()> {
        let OperatorQueue::Partitioned(queue) = &mut self.queue else {
            bail!("operator {} is not partitioned", self.def.id);
        };
        match container {
            Some(container) => queue.install_container(container)?,
            None => queue.ensure_container(partition_id)?,
        }
        self.state
            .install_partition(partition_id, stores.unwrap_or_default())
    }

    /// Removes every buffered tuple of a non-partitioned operator.
    pub fn take_buffered(&mut self) -> Result<Vec<TupleBatch>> {
        self.absorb_inbox()?;
        match &mut self.queue {
            OperatorQueue::Default(queue) => Ok(queue.take_all()),
            OperatorQueue::Partitioned(_) => bail!("operator {} is partitioned", self.def.id),
        }
    }

    pub fn set_replica_index(&mut self, replica_index: usize) {
        self.replica_index = replica_index;
    }

    pub fn shutdown(&mut self) -> Result<()> {
        let dropped = self.queue.clear();
        if dropped > 0 {
            info!(
                operator = %self.def.id,
                replica = self.replica_index,
                dropped,
                "dropped buffered tuples on shutdown"
            );
        }
        self.operator.shutdown()
    }
}

impl std::fmt::Debug for OperatorReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorReplica")
            .field("operator", &self.def.id)
            .field("replica_index", &self.replica_index)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "tests/operator_replica_tests.rs"]
mod tests;
