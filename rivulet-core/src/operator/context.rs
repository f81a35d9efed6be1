//! Contexts handed to operators during initialization and invocation.

use ahash::AHashMap;

use crate::pipeline::UpstreamContext;
use crate::types::{PartitionKey, Tuple, Tuples, Value};

/// Key-value state of a stateful operator, or of one partition key of a
/// partitioned stateful operator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvStore {
    entries: AHashMap<String, Value>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    pub fn get_int_or(&self, name: &str, default: i64) -> i64 {
        self.get(name).and_then(Value::as_int).unwrap_or(default)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Passed to [`Operator::init`](super::Operator::init).
pub struct InitContext<'a> {
    pub operator_id: &'a str,
    pub replica_index: usize,
    pub input_port_count: usize,
    pub output_port_count: usize,
    pub partition_field_names: &'a [String],
    pub upstream_context: &'a UpstreamContext,
}

impl InitContext<'_> {
    pub fn is_input_port_open(&self, port: usize) -> bool {
        self.upstream_context.connection_status(port).is_active()
    }
}

/// Why an operator is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationReason {
    /// The declared scheduling strategy is satisfied.
    Success,
    /// Some upstream connections closed; the operator is flushing what is left.
    InputPortClosed,
    /// Every upstream connection closed; this is among the final invocations.
    ShutdownRequested,
}

/// Passed to [`Operator::invoke`](super::Operator::invoke).
///
/// `kv` is present for stateful operators; for partitioned stateful operators
/// it is the store of `partition_key`.
pub struct InvocationContext<'a> {
    pub reason: InvocationReason,
    pub input: Tuples,
    pub output: &'a mut Tuples,
    pub partition_key: Option<&'a PartitionKey>,
    pub kv: Option<&'a mut KvStore>,
}

impl InvocationContext<'_> {
    pub fn input(&self, port: usize) -> &[Tuple] {
        self.input.get(port)
    }

    pub fn emit(&mut self, port: usize, tuple: Tuple) {
        self.output.add(port, tuple);
    }

    /// State of the invocation. Fails for stateless operators.
    pub fn kv(&mut self) -> anyhow::Result<&mut KvStore> {
        self.kv
            .as_deref_mut()
            .ok_or_else(|| anyhow::anyhow!("operator has no key-value state"))
    }

    pub fn is_success(&self) -> bool {
        self.reason == InvocationReason::Success
    }
}
