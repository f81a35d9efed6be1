//! Input queues of one operator replica.
//!
//! - [`DefaultOperatorQueue`]: one FIFO per input port, for stateless and
//!   stateful operators.
//! - [`PartitionedOperatorQueue`]: one [`TupleQueueContainer`] per partition
//!   owned by the replica, for partitioned stateful operators. Containers move
//!   between replicas when the region is rebalanced.

use anyhow::{Result, anyhow};

use crate::operator::TupleAvailabilityByPort;
use crate::partition::PartitionKeyExtractor;
use crate::types::{PartitionKey, Tuple, Tuples};

use super::{TupleBatch, TupleQueue, TupleQueueContainer, TupleQueueDrainer, is_drainable};

#[derive(Debug)]
pub enum OperatorQueue {
    Default(DefaultOperatorQueue),
    Partitioned(PartitionedOperatorQueue),
}

impl OperatorQueue {
    pub fn offer(&mut self, port: usize, tuples: Vec<Tuple>) -> Result<()> {
        match self {
            OperatorQueue::Default(queue) => {
                queue.offer(port, tuples);
                Ok(())
            }
            OperatorQueue::Partitioned(queue) => queue.offer(port, tuples),
        }
    }

    pub fn set_tuple_counts(&mut self, tuple_counts: &[usize], by_port: TupleAvailabilityByPort) -> Result<()> {
        match self {
            OperatorQueue::Default(queue) => queue.set_tuple_counts(tuple_counts, by_port),
            OperatorQueue::Partitioned(queue) => queue.set_tuple_counts(tuple_counts, by_port),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            OperatorQueue::Default(queue) => queue.is_empty(),
            OperatorQueue::Partitioned(queue) => queue.is_empty(),
        }
    }

    pub fn available_tuple_counts(&self) -> Vec<usize> {
        match self {
            OperatorQueue::Default(queue) => queue.queues.iter().map(TupleQueue::len).collect(),
            OperatorQueue::Partitioned(queue) => {
                let mut counts = vec![0; queue.input_port_count];
                for container in queue.containers.iter().flatten() {
                    container.add_available_tuple_counts(&mut counts);
                }
                counts
            }
        }
    }

    pub fn clear(&mut self) -> usize {
        match self {
            OperatorQueue::Default(queue) => queue.queues.iter_mut().map(TupleQueue::clear).sum(),
            OperatorQueue::Partitioned(queue) => queue
                .containers
                .iter_mut()
                .flatten()
                .map(TupleQueueContainer::clear)
                .sum(),
        }
    }
}

#[derive(Debug)]
pub struct DefaultOperatorQueue {
    operator_id: String,
    queues: Vec<TupleQueue>,
    tuple_counts: Vec<usize>,
    by_port: TupleAvailabilityByPort,
}

impl DefaultOperatorQueue {
    pub fn new(operator_id: impl Into<String>, input_port_count: usize) -> Self {
        Self {
            operator_id: operator_id.into(),
            queues: vec![TupleQueue::new(); input_port_count],
            tuple_counts: vec![1; input_port_count],
            by_port: TupleAvailabilityByPort::AnyPort,
        }
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn offer(&mut self, port: usize, tuples: Vec<Tuple>) {
        self.queues[port].offer_all(tuples);
    }

    /// Drains into `drainer`; `None` if nothing was drained.
    pub fn drain(&mut self, drainer: &mut dyn TupleQueueDrainer) -> Option<Tuples> {
        drainer.drain(false, None, &mut self.queues);
        let (_, tuples) = drainer.take();
        (!tuples.is_empty()).then_some(tuples)
    }

    pub fn is_drainable(&self) -> bool {
        is_drainable(&self.tuple_counts, self.by_port, &self.queues)
    }

    pub fn set_tuple_counts(&mut self, tuple_counts: &[usize], by_port: TupleAvailabilityByPort) -> Result<()> {
        if tuple_counts.len() != self.queues.len() {
            return Err(anyhow!(
                "operator {} has {} input ports, got {} tuple counts",
                self.operator_id,
                self.queues.len(),
                tuple_counts.len()
            ));
        }
        self.tuple_counts = tuple_counts.to_vec();
        self.by_port = by_port;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(TupleQueue::is_empty)
    }

    /// Removes every buffered tuple, grouped by port.
    pub fn take_all(&mut self) -> Vec<TupleBatch> {
        self.queues
            .iter_mut()
            .enumerate()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(port, queue)| TupleBatch {
                port,
                tuples: queue.poll_all(),
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct PartitionedOperatorQueue {
    operator_id: String,
    input_port_count: usize,
    extractor: PartitionKeyExtractor,
    /// Indexed by partition id; `Some` for the partitions this replica owns.
    containers: Vec<Option<TupleQueueContainer>>,
    tuple_counts: Vec<usize>,
    by_port: TupleAvailabilityByPort,
}

impl PartitionedOperatorQueue {
    pub fn new(
        operator_id: impl Into<String>,
        input_port_count: usize,
        extractor: PartitionKeyExtractor,
        partition_count: usize,
        owned_partitions: &[usize],
    ) -> Self {
        let operator_id = operator_id.into();
        let mut containers: Vec<Option<TupleQueueContainer>> =
            (0..partition_count).map(|_| None).collect();
        for &partition_id in owned_partitions {
            containers[partition_id] = Some(TupleQueueContainer::new(
                operator_id.clone(),
                input_port_count,
                partition_id,
            ));
        }
        Self {
            operator_id,
            input_port_count,
            extractor,
            containers,
            tuple_counts: vec![1; input_port_count],
            by_port: TupleAvailabilityByPort::AnyPort,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.containers.len()
    }

    pub fn offer(&mut self, port: usize, tuples: Vec<Tuple>) -> Result<()> {
        let partition_count = self.containers.len();
        for tuple in tuples {
            let (key, partition_id) = self.extractor.partition(&tuple, partition_count)?;
            let container = self.containers[partition_id].as_mut().ok_or_else(|| {
                anyhow!(
                    "operator {} received key {} of partition {} it does not own",
                    self.operator_id,
                    key,
                    partition_id
                )
            })?;
            container.offer(port, tuple, key);
        }
        Ok(())
    }

    /// Drains every owned partition through `drainer`, calling `invoke` with
    /// the partition id, key and drained tuples of each drained key.
    ///
    /// A greedy drainer flushes every buffered key; any other drainer takes
    /// the keys that are drainable when the partition is visited.
    pub fn drain_each<F>(&mut self, drainer: &mut dyn TupleQueueDrainer, mut invoke: F) -> Result<()>
    where
        F: FnMut(usize, PartitionKey, Tuples) -> Result<()>,
    {
        let greedy = drainer.is_greedy();
        for container in self.containers.iter_mut().flatten() {
            let partition_id = container.partition_id();
            loop {
                if !greedy && container.drainable_key_count() == 0 {
                    break;
                }
                container.drain(false, drainer);
                let (key, tuples) = drainer.take();
                match key {
                    Some(key) if !tuples.is_empty() => invoke(partition_id, key, tuples)?,
                    _ => break,
                }
            }
        }
        Ok(())
    }

    pub fn set_tuple_counts(&mut self, tuple_counts: &[usize], by_port: TupleAvailabilityByPort) -> Result<()> {
        for container in self.containers.iter_mut().flatten() {
            container.set_tuple_counts(tuple_counts, by_port)?;
        }
        self.tuple_counts = tuple_counts.to_vec();
        self.by_port = by_port;
        Ok(())
    }

    pub fn drainable_key_count(&self) -> usize {
        self.containers
            .iter()
            .flatten()
            .map(TupleQueueContainer::drainable_key_count)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.iter().flatten().all(TupleQueueContainer::is_empty)
    }

    pub fn owned_partitions(&self) -> Vec<usize> {
        self.containers
            .iter()
            .flatten()
            .map(TupleQueueContainer::partition_id)
            .collect()
    }

    /// Removes every owned container.
    pub fn take_containers(&mut self) -> Vec<TupleQueueContainer> {
        self.containers.iter_mut().filter_map(Option::take).collect()
    }

    /// Takes ownership of `container`, applying this queue's thresholds.
    pub fn install_container(&mut self, mut container: TupleQueueContainer) -> Result<()> {
        container.set_tuple_counts(&self.tuple_counts, self.by_port)?;
        let partition_id = container.partition_id();
        let slot = self.containers.get_mut(partition_id).ok_or_else(|| {
            anyhow!(
                "partition {} is out of range for operator {}",
                partition_id,
                self.operator_id
            )
        })?;
        if slot.is_some() {
            return Err(anyhow!(
                "operator {} already owns partition {}",
                self.operator_id,
                partition_id
            ));
        }
        *slot = Some(container);
        Ok(())
    }

    /// Creates an empty container for a partition without one.
    pub fn ensure_container(&mut self, partition_id: usize) -> Result<()> {
        if self.containers.get(partition_id).is_some_and(Option::is_some) {
            return Ok(());
        }
        let container = TupleQueueContainer::new(self.operator_id.clone(), self.input_port_count, partition_id);
        self.install_container(container)
    }
}

#[cfg(test)]
#[path = "tests/operator_queue_tests.rs"]
mod tests;
