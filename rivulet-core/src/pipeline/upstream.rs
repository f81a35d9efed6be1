//! # Upstream context
//!
//! A versioned, immutable snapshot of which input ports of a pipeline's first
//! operator still have live upstream producers. A new snapshot with a higher
//! version replaces the old one whenever an upstream pipeline completes.
//!
//! Version 0 with zero ports denotes a running source pipeline. Sources are
//! closed only by an explicit shutdown, which hands them a version 1 context.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::operator::{OperatorDef, SchedulingStrategy, TupleAvailabilityByPort};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Active,
    Closed,
}

impl ConnectionStatus {
    pub fn is_active(self) -> bool {
        self == ConnectionStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamContext {
    version: u64,
    statuses: Vec<ConnectionStatus>,
}

impl UpstreamContext {
    pub fn new(version: u64, statuses: Vec<ConnectionStatus>) -> Self {
        Self { version, statuses }
    }

    /// Version 0 context with every port active.
    pub fn initial(port_count: usize) -> Self {
        Self::new(0, vec![ConnectionStatus::Active; port_count])
    }

    /// Context handed to source pipelines on shutdown.
    pub fn shutdown_source() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn statuses(&self) -> &[ConnectionStatus] {
        &self.statuses
    }

    pub fn port_count(&self) -> usize {
        self.statuses.len()
    }

    /// Status of `port`. Ports beyond the snapshot read as closed.
    pub fn connection_status(&self, port: usize) -> ConnectionStatus {
        self.statuses
            .get(port)
            .copied()
            .unwrap_or(ConnectionStatus::Closed)
    }

    pub fn is_active_connection_present(&self) -> bool {
        self.statuses.iter().any(|s| s.is_active())
    }

    /// Copy with `port` closed and the version bumped. Closing an already
    /// closed port still bumps the version.
    pub fn with_closed_upstream_connection(&self, port: usize) -> Self {
        let mut statuses = self.statuses.clone();
        if let Some(status) = statuses.get_mut(port) {
            *status = ConnectionStatus::Closed;
        }
        Self::new(self.version + 1, statuses)
    }

    /// Whether `strategy`, declared by `operator`, can still be satisfied.
    pub fn is_invokable(&self, operator: &OperatorDef, strategy: &SchedulingStrategy) -> bool {
        let invokable = match strategy {
            SchedulingStrategy::WhenAvailable => {
                operator.input_port_count == 0 && self.version == 0
            }
            SchedulingStrategy::WhenTuplesAvailable(availability) => {
                let mut referenced = (0..availability.port_count())
                    .filter(|&port| availability.tuple_count(port) > 0)
                    .peekable();
                match availability.by_port {
                    TupleAvailabilityByPort::AnyPort => {
                        referenced.any(|port| self.connection_status(port).is_active())
                    }
                    TupleAvailabilityByPort::AllPorts => {
                        referenced.peek().is_some()
                            && referenced.all(|port| self.connection_status(port).is_active())
                    }
                }
            }
        };
        if !invokable {
            info!(
                operator = %operator.id,
                version = self.version,
                statuses = ?self.statuses,
                ?strategy,
                "scheduling strategy is no longer invokable"
            );
        }
        invokable
    }
}

#[cfg(test)]
#[path = "tests/upstream_tests.rs"]
mod tests;
