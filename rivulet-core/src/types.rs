//! # Tuple model
//!
//! Values flowing between operators:
//!
//! - [`Value`]: a single dynamically typed field value.
//! - [`Tuple`]: a record of named fields.
//! - [`Tuples`]: a batch of tuples grouped by port index; used both as the
//!   input handed to an operator and as the output it produces.
//! - [`PartitionKey`]: the values of a tuple's partition fields.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A dynamically typed field value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

// Floats compare by bit pattern so that values are usable as partition keys.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Str(v) => v.hash(state),
            Value::Bool(v) => v.hash(state),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{:?}", v),
            Value::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// A record of named fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuple {
    fields: BTreeMap<String, Value>,
}

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_int)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Tuples grouped by port index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuples {
    ports: Vec<Vec<Tuple>>,
}

impl Tuples {
    pub fn new(port_count: usize) -> Self {
        Self {
            ports: vec![Vec::new(); port_count],
        }
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Appends a tuple to the given port, growing the port vector if needed.
    pub fn add(&mut self, port: usize, tuple: Tuple) {
        if port >= self.ports.len() {
            self.ports.resize_with(port + 1, Vec::new);
        }
        self.ports[port].push(tuple);
    }

    pub fn add_all(&mut self, port: usize, tuples: impl IntoIterator<Item = Tuple>) {
        for tuple in tuples {
            self.add(port, tuple);
        }
    }

    pub fn get(&self, port: usize) -> &[Tuple] {
        self.ports.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn take(&mut self, port: usize) -> Vec<Tuple> {
        self.ports.get_mut(port).map(std::mem::take).unwrap_or_default()
    }

    pub fn tuple_count(&self, port: usize) -> usize {
        self.get(port).len()
    }

    pub fn total_count(&self) -> usize {
        self.ports.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.iter().all(Vec::is_empty)
    }

    pub fn clear(&mut self) {
        self.ports.iter_mut().for_each(Vec::clear);
    }

    /// Consumes the batch, yielding `(port, tuples)` for every non-empty port.
    pub fn into_ports(self) -> impl Iterator<Item = (usize, Vec<Tuple>)> {
        self.ports
            .into_iter()
            .enumerate()
            .filter(|(_, tuples)| !tuples.is_empty())
    }
}

/// Values of a tuple's partition fields, in partition field order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey(pub Vec<Value>);

impl PartitionKey {
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
#[path = "tests/types_tests.rs"]
mod tests;
