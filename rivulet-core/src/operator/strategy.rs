//! # Scheduling strategies
//!
//! An operator declares, when it is initialized, under which condition on its
//! buffered input it may be invoked:
//!
//! - [`SchedulingStrategy::WhenAvailable`]: source operators with no input
//!   ports; invoked on every runner iteration.
//! - [`SchedulingStrategy::WhenTuplesAvailable`]: invoked once the per-port
//!   buffered tuple counts satisfy the declared thresholds, on any port or on
//!   all ports.

use serde::{Deserialize, Serialize};

/// Whether one port or every port must meet its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TupleAvailabilityByPort {
    AnyPort,
    AllPorts,
}

/// How many tuples a satisfied port hands to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TupleAvailabilityByCount {
    /// Exactly the threshold count per invocation.
    Exact,
    /// Everything buffered, provided at least the threshold is present.
    AtLeast,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleAvailability {
    pub by_port: TupleAvailabilityByPort,
    pub by_count: TupleAvailabilityByCount,
    /// Required tuple count per input port. Zero means the port is not
    /// referenced by the strategy.
    pub tuple_counts: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulingStrategy {
    WhenAvailable,
    WhenTuplesAvailable(TupleAvailability),
}

impl SchedulingStrategy {
    /// `tuple_count` tuples required on any of `port_count` ports.
    pub fn on_any_port(
        by_count: TupleAvailabilityByCount,
        port_count: usize,
        tuple_count: usize,
    ) -> Self {
        Self::on_ports(
            TupleAvailabilityByPort::AnyPort,
            by_count,
            vec![tuple_count; port_count],
        )
    }

    /// `tuple_count` tuples required on every one of `port_count` ports.
    pub fn on_all_ports(
        by_count: TupleAvailabilityByCount,
        port_count: usize,
        tuple_count: usize,
    ) -> Self {
        Self::on_ports(
            TupleAvailabilityByPort::AllPorts,
            by_count,
            vec![tuple_count; port_count],
        )
    }

    pub fn on_ports(
        by_port: TupleAvailabilityByPort,
        by_count: TupleAvailabilityByCount,
        tuple_counts: Vec<usize>,
    ) -> Self {
        SchedulingStrategy::WhenTuplesAvailable(TupleAvailability {
            by_port,
            by_count,
            tuple_counts,
        })
    }

    pub fn tuple_availability(&self) -> Option<&TupleAvailability> {
        match self {
            SchedulingStrategy::WhenAvailable => None,
            SchedulingStrategy::WhenTuplesAvailable(availability) => Some(availability),
        }
    }
}

impl TupleAvailability {
    pub fn tuple_count(&self, port: usize) -> usize {
        self.tuple_counts.get(port).copied().unwrap_or(0)
    }

    pub fn port_count(&self) -> usize {
        self.tuple_counts.len()
    }

    pub fn max_tuple_count(&self) -> usize {
        self.tuple_counts.iter().copied().max().unwrap_or(0)
    }
}
