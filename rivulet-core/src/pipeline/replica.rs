//! Pipeline replica: a chain of operator replicas executed by one runner.
//!
//! Input enters through the first operator's inbox; every other operator is
//! fed directly by its predecessor within the same invocation. The output of
//! the last operator is handed back to the runner for the downstream sender.

use std::sync::Arc;

use anyhow::{Result, ensure};

use crate::tuplequeue::InboxSender;
use crate::types::Tuples;

use super::{
    OperatorReplica, OperatorReplicaStatus, PipelineReplicaId, RunnablePipeline, UpstreamContext,
};

/// `(source output port, target input port)` pairs between two consecutive operators.
pub type PortLinks = Vec<(usize, usize)>;

#[derive(Debug)]
pub struct PipelineReplica {
    id: PipelineReplicaId,
    operators: Vec<OperatorReplica>,
    /// `links[i]` connects operator `i` to operator `i + 1`.
    links: Vec<PortLinks>,
    upstream_context: Arc<UpstreamContext>,
    /// Upstream view of operators after the first, derived from their predecessor.
    chained_contexts: Vec<Arc<UpstreamContext>>,
}

impl PipelineReplica {
    pub fn new(
        id: PipelineReplicaId,
        operators: Vec<OperatorReplica>,
        links: Vec<PortLinks>,
        upstream_context: Arc<UpstreamContext>,
    ) -> Result<Self> {
        ensure!(!operators.is_empty(), "pipeline replica {} has no operators", id);
        ensure!(
            links.len() + 1 == operators.len(),
            "pipeline replica {} has {} operators but {} links",
            id,
            operators.len(),
            links.len()
        );
        let chained_contexts = operators
            .iter()
            .enumerate()
            .map(|(index, op)| {
                let predecessor = match index {
                    0 => OperatorReplicaStatus::Initial,
                    _ => operators[index - 1].status(),
                };
                Arc::new(chained_context(predecessor, op.def().input_port_count))
            })
            .collect();
        Ok(Self {
            id,
            operators,
            links,
            upstream_context,
            chained_contexts,
        })
    }

    /// Initializes every operator replica that is still `INITIAL`.
    pub fn init(&mut self) -> Result<()> {
        for index in 0..self.operators.len() {
            if self.operators[index].status() != OperatorReplicaStatus::Initial {
                continue;
            }
            let context = if index == 0 {
                Arc::clone(&self.upstream_context)
            } else {
                Arc::clone(&self.chained_contexts[index])
            };
            self.operators[index].init(context)?;
        }
        Ok(())
    }

    pub fn id(&self) -> PipelineReplicaId {
        self.id
    }

    pub fn set_id(&mut self, id: PipelineReplicaId) {
        self.id = id;
        for operator in &mut self.operators {
            operator.set_replica_index(id.replica_index);
        }
    }

    pub fn operators(&self) -> &[OperatorReplica] {
        &self.operators
    }

    pub fn operators_mut(&mut self) -> &mut [OperatorReplica] {
        &mut self.operators
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    /// Splits the replica back into its operators and links.
    pub fn into_parts(self) -> (Vec<OperatorReplica>, Vec<PortLinks>, Arc<UpstreamContext>) {
        (self.operators, self.links, self.upstream_context)
    }

    /// Entry point for upstream senders.
    pub fn inbox_sender(&self) -> InboxSender {
        self.operators[0].inbox_sender()
    }

    pub fn shutdown_operators(&mut self) -> Result<()> {
        let mut first_error = None;
        for operator in &mut self.operators {
            if let Err(err) = operator.shutdown() {
                tracing::warn!(replica = %self.id, operator = %operator.operator_id(), error = %err, "operator shutdown failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl RunnablePipeline for PipelineReplica {
    fn id(&self) -> PipelineReplicaId {
        self.id
    }

    fn invoke(&mut self) -> Result<Option<Tuples>> {
        let mut carried: Option<Tuples> = None;
        let last = self.operators.len() - 1;
        for index in 0..self.operators.len() {
            if index > 0 {
                let predecessor = self.operators[index - 1].status();
                if predecessor == OperatorReplicaStatus::Completed
                    && self.chained_contexts[index].is_active_connection_present()
                {
                    let ports = self.operators[index].def().input_port_count;
                    self.chained_contexts[index] = Arc::new(chained_context(predecessor, ports));
                }
                if let Some(tuples) = carried.take() {
                    for &(source_port, target_port) in &self.links[index - 1] {
                        let forwarded = tuples.get(source_port).to_vec();
                        if !forwarded.is_empty() {
                            self.operators[index].offer(target_port, forwarded)?;
                        }
                    }
                }
            }
            let context = if index == 0 {
                &self.upstream_context
            } else {
                &self.chained_contexts[index]
            };
            let output = self.operators[index].invoke(context)?;
            if index == last {
                return Ok(output);
            }
            carried = output;
        }
        Ok(None)
    }

    fn is_completed(&self) -> bool {
        self.operators
            .iter()
            .all(|op| op.status() == OperatorReplicaStatus::Completed)
    }

    fn set_upstream_context(&mut self, upstream_context: Arc<UpstreamContext>) {
        self.upstream_context = upstream_context;
    }

    fn upstream_context(&self) -> &Arc<UpstreamContext> {
        &self.upstream_context
    }
}

/// Upstream view of an operator fed by a predecessor in `predecessor` status.
pub fn chained_context(predecessor: OperatorReplicaStatus, port_count: usize) -> UpstreamContext {
    if predecessor == OperatorReplicaStatus::Completed {
        UpstreamContext::new(1, vec![super::ConnectionStatus::Closed; port_count])
    } else {
        UpstreamContext::initial(port_count)
    }
}

#[cfg(test)]
#[path = "tests/replica_tests.rs"]
mod tests;
