//! # Flow definition
//!
//! A [`FlowDef`] is the logical DAG of a flow: operator definitions keyed by
//! id, plus port-to-port [`Connection`]s. It is immutable once built and
//! shared behind an `Arc` by everything that derives runtime structures
//! from it.
//!
//! ```text
//! beacon1 ──┐
//!           ├──> joiner ──> summer ──> collector
//! beacon2 ──┘
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Result, bail};

use crate::operator::OperatorDef;

/// One port of one operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port {
    pub operator_id: String,
    pub port: usize,
}

impl Port {
    pub fn new(operator_id: impl Into<String>, port: usize) -> Self {
        Self {
            operator_id: operator_id.into(),
            port,
        }
    }
}

/// An edge from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Connection {
    pub source: Port,
    pub target: Port,
}

#[derive(Debug)]
pub struct FlowDef {
    operators: BTreeMap<String, Arc<OperatorDef>>,
    connections: Vec<Connection>,
}

impl FlowDef {
    pub fn operator(&self, id: &str) -> Option<&Arc<OperatorDef>> {
        self.operators.get(id)
    }

    pub fn operators(&self) -> impl Iterator<Item = &Arc<OperatorDef>> {
        self.operators.values()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Connections leaving `operator_id`, sorted.
    pub fn outbound_connections(&self, operator_id: &str) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.source.operator_id == operator_id)
            .collect()
    }

    /// Connections entering `operator_id`, sorted.
    pub fn inbound_connections(&self, operator_id: &str) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.target.operator_id == operator_id)
            .collect()
    }

    pub fn downstream_operators(&self, operator_id: &str) -> BTreeSet<&str> {
        self.outbound_connections(operator_id)
            .into_iter()
            .map(|c| c.target.operator_id.as_str())
            .collect()
    }

    pub fn upstream_operators(&self, operator_id: &str) -> BTreeSet<&str> {
        self.inbound_connections(operator_id)
            .into_iter()
            .map(|c| c.source.operator_id.as_str())
            .collect()
    }

    /// `(source port, target port)` pairs of every connection from `source` to `target`.
    pub fn port_pairs(&self, source: &str, target: &str) -> Vec<(usize, usize)> {
        self.connections
            .iter()
            .filter(|c| c.source.operator_id == source && c.target.operator_id == target)
            .map(|c| (c.source.port, c.target.port))
            .collect()
    }

    /// Operators without input ports.
    pub fn sources(&self) -> Vec<&Arc<OperatorDef>> {
        self.operators.values().filter(|o| o.is_source()).collect()
    }

    /// Operator ids in topological order (Kahn's algorithm, ties by id).
    pub fn topological_order(&self) -> Vec<&str> {
        let mut in_degree: HashMap<&str, usize> =
            self.operators.keys().map(|id| (id.as_str(), 0)).collect();
        for id in self.operators.keys() {
            for downstream in self.downstream_operators(id) {
                if let Some(degree) = in_degree.get_mut(downstream) {
                    *degree += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.operators.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for downstream in self.downstream_operators(id) {
                if let Some(degree) = in_degree.get_mut(downstream) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(downstream);
                    }
                }
            }
        }
        order
    }
}

/// Validating builder for [`FlowDef`].
#[derive(Debug, Default)]
pub struct FlowDefBuilder {
    operators: BTreeMap<String, Arc<OperatorDef>>,
    connections: BTreeSet<Connection>,
}

impl FlowDefBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, operator: OperatorDef) -> Result<&mut Self> {
        operator.validate()?;
        if self.operators.contains_key(&operator.id) {
            bail!("operator {} is already added", operator.id);
        }
        self.operators.insert(operator.id.clone(), Arc::new(operator));
        Ok(self)
    }

    /// Connects output port 0 of `source` to input port 0 of `target`.
    pub fn connect(&mut self, source: &str, target: &str) -> Result<&mut Self> {
        self.connect_ports(source, 0, target, 0)
    }

    pub fn connect_ports(
        &mut self,
        source: &str,
        source_port: usize,
        target: &str,
        target_port: usize,
    ) -> Result<&mut Self> {
        let Some(source_def) = self.operators.get(source) else {
            bail!("unknown source operator {}", source);
        };
        let Some(target_def) = self.operators.get(target) else {
            bail!("unknown target operator {}", target);
        };
        if source == target {
            bail!("operator {} cannot be connected to itself", source);
        }
        if source_port >= source_def.output_port_count {
            bail!("operator {} has no output port {}", source, source_port);
        }
        if target_port >= target_def.input_port_count {
            bail!("operator {} has no input port {}", target, target_port);
        }
        self.connections.insert(Connection {
            source: Port::new(source, source_port),
            target: Port::new(target, target_port),
        });
        Ok(self)
    }

    pub fn build(&mut self) -> Result<FlowDef> {
        if self.operators.is_empty() {
            bail!("flow has no operators");
        }
        let flow = FlowDef {
            operators: std::mem::take(&mut self.operators),
            connections: std::mem::take(&mut self.connections).into_iter().collect(),
        };

        for operator in flow.operators() {
            let connected: BTreeSet<usize> = flow
                .inbound_connections(&operator.id)
                .into_iter()
                .map(|c| c.target.port)
                .collect();
            if connected.len() != operator.input_port_count {
                bail!(
                    "operator {} has {} input ports but {} are connected",
                    operator.id,
                    operator.input_port_count,
                    connected.len()
                );
            }
        }
        if flow.topological_order().len() != flow.operators.len() {
            bail!("flow contains a cycle");
        }
        Ok(flow)
    }
}

#[cfg(test)]
#[path = "tests/flow_def_tests.rs"]
mod tests;
