//! Flow definitions: operators and the port-level connections between them.

pub mod flow_def;

pub use flow_def::*;
