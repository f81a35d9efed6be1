//! Downstream tuple senders.
//!
//! A pipeline replica forwards the output of its last operator through one
//! [`DownstreamSender`]. The shape is chosen when the pipeline is wired:
//! - `Direct`: every tuple goes to one downstream replica.
//! - `Partitioned`: tuples are routed by partition key through the current
//!   [`PartitionDistribution`] of the downstream region.
//! - `Composite`: one sender per downstream operator.
//! - `Noop`: the pipeline has no downstream operators.
//!
//! Sends block while the target inbox is full and fail fast once the flow-wide
//! [`FailureFlag`] is set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::partition::{PartitionDistribution, PartitionKeyExtractor};
use crate::tuplequeue::{FailureFlag, InboxSender, TupleBatch};
use crate::types::{Tuple, Tuples};

use super::PortLinks;

/// Failure flag and retry interval shared by every sender of a flow.
#[derive(Debug, Clone)]
pub struct SendPolicy {
    pub failure: FailureFlag,
    pub retry_interval: Duration,
}

impl SendPolicy {
    pub fn new(failure: FailureFlag, retry_interval: Duration) -> Self {
        Self {
            failure,
            retry_interval,
        }
    }

    fn send(&self, target: &InboxSender, port: usize, tuples: Vec<Tuple>) -> Result<()> {
        target.send(TupleBatch { port, tuples }, &self.failure, self.retry_interval)
    }
}

#[derive(Debug, Clone)]
pub enum DownstreamSender {
    Noop,
    Direct {
        /// `(output port, downstream input port)` pairs.
        ports: PortLinks,
        target: InboxSender,
        policy: SendPolicy,
    },
    Partitioned {
        ports: PortLinks,
        /// Inboxes indexed by downstream replica index.
        targets: Vec<InboxSender>,
        distribution: Arc<PartitionDistribution>,
        extractor: PartitionKeyExtractor,
        policy: SendPolicy,
    },
    Composite(Vec<DownstreamSender>),
}

impl DownstreamSender {
    /// Combines per-operator senders, collapsing trivial cases.
    pub fn compose(mut senders: Vec<DownstreamSender>) -> Self {
        senders.retain(|s| !matches!(s, DownstreamSender::Noop));
        match senders.len() {
            0 => DownstreamSender::Noop,
            1 => senders.remove(0),
            _ => DownstreamSender::Composite(senders),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, DownstreamSender::Noop)
    }

    /// Forwards `tuples`, blocking until every batch is accepted.
    pub fn send(&self, tuples: &Tuples) -> Result<()> {
        match self {
            DownstreamSender::Noop => Ok(()),
            DownstreamSender::Direct {
                ports,
                target,
                policy,
            } => {
                for &(output_port, input_port) in ports {
                    let batch = tuples.get(output_port);
                    if !batch.is_empty() {
                        policy.send(target, input_port, batch.to_vec())?;
                    }
                }
                Ok(())
            }
            DownstreamSender::Partitioned {
                ports,
                targets,
                distribution,
                extractor,
                policy,
            } => {
                for &(output_port, input_port) in ports {
                    let batch = tuples.get(output_port);
                    if batch.is_empty() {
                        continue;
                    }
                    let mut by_replica: Vec<Vec<Tuple>> = vec![Vec::new(); targets.len()];
                    for tuple in batch {
                        let (_, partition_id) =
                            extractor.partition(tuple, distribution.partition_count())?;
                        by_replica[distribution.replica_index(partition_id)].push(tuple.clone());
                    }
                    for (replica_index, routed) in by_replica.into_iter().enumerate() {
                        if !routed.is_empty() {
                            policy.send(&targets[replica_index], input_port, routed)?;
                        }
                    }
                }
                Ok(())
            }
            DownstreamSender::Composite(senders) => {
                for sender in senders {
                    sender.send(tuples)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/sender_tests.rs"]
mod tests;
