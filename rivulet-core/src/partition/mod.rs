//! Partitioning: mapping tuples to partitions, and partitions to replicas.

pub mod partitioner;
pub mod service;

pub use partitioner::*;
pub use service::*;
