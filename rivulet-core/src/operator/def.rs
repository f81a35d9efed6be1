//! Operator trait and operator definitions.

use std::fmt;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use super::{InitContext, InvocationContext, SchedulingStrategy};

/// User-defined processing logic.
///
/// One instance exists per operator replica. Instances are created through
/// [`OperatorDef::create_operator`], initialized once, invoked by the runner
/// thread that currently owns the replica, and shut down when the flow ends.
/// Instances move between threads across reconfigurations, hence `Send`.
pub trait Operator: Send {
    /// Declares the initial scheduling strategy.
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<SchedulingStrategy>;

    /// Processes the drained input in `ctx.input`, emitting into `ctx.output`.
    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()>;

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type OperatorFactory = Arc<dyn Fn() -> Box<dyn Operator> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorType {
    Stateless,
    /// Global state; runs with a single replica.
    Stateful,
    /// State scoped by partition key; may be replicated.
    PartitionedStateful,
}

#[derive(Clone)]
pub struct OperatorDef {
    pub id: String,
    pub operator_type: OperatorType,
    pub input_port_count: usize,
    pub output_port_count: usize,
    /// Fields forming the partition key. Only for partitioned stateful operators.
    pub partition_field_names: Vec<String>,
    /// Fields the operator declares on its input. A stateless operator
    /// declaring every partition field of a preceding partitioned operator may
    /// run inside that operator's region.
    pub input_fields: Vec<String>,
    factory: OperatorFactory,
}

impl OperatorDef {
    /// A definition with one input and one output port.
    pub fn new<F>(id: impl Into<String>, operator_type: OperatorType, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Operator> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            operator_type,
            input_port_count: 1,
            output_port_count: 1,
            partition_field_names: Vec::new(),
            input_fields: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_ports(mut self, input_port_count: usize, output_port_count: usize) -> Self {
        self.input_port_count = input_port_count;
        self.output_port_count = output_port_count;
        self
    }

    pub fn with_partition_fields<S: Into<String>>(
        mut self,
        fields: impl IntoIterator<Item = S>,
    ) -> Self {
        self.partition_field_names = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.input_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn create_operator(&self) -> Box<dyn Operator> {
        (self.factory)()
    }

    pub fn is_source(&self) -> bool {
        self.input_port_count == 0
    }

    pub fn is_partitioned(&self) -> bool {
        self.operator_type == OperatorType::PartitionedStateful
    }

    /// Whether the declared input contains every one of `fields`.
    pub fn declares_input_fields(&self, fields: &[String]) -> bool {
        !fields.is_empty() && fields.iter().all(|f| self.input_fields.contains(f))
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("operator id must not be empty");
        }
        match self.operator_type {
            OperatorType::PartitionedStateful => {
                if self.partition_field_names.is_empty() {
                    bail!("partitioned operator {} declares no partition fields", self.id);
                }
                if self.input_port_count == 0 {
                    bail!("partitioned operator {} has no input ports", self.id);
                }
            }
            OperatorType::Stateless | OperatorType::Stateful => {
                if !self.partition_field_names.is_empty() {
                    bail!(
                        "operator {} declares partition fields but is {:?}",
                        self.id,
                        self.operator_type
                    );
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for OperatorDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorDef")
            .field("id", &self.id)
            .field("operator_type", &self.operator_type)
            .field("input_port_count", &self.input_port_count)
            .field("output_port_count", &self.output_port_count)
            .field("partition_field_names", &self.partition_field_names)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "tests/def_tests.rs"]
mod tests;
