//! # Rivulet Core
//!
//! Runtime core of a partitioned, pipelined stream processing engine running
//! inside one process.
//!
//! - [`flow`] and [`operator`]: the logical flow and the operator API.
//! - [`region`]: grouping operators into regions and region execution plans.
//! - [`partition`]: partition keys and partition-to-replica distributions.
//! - [`tuplequeue`]: operator input buffering and pipeline inboxes.
//! - [`pipeline`]: replicas, runners, senders and the [`PipelineManager`](pipeline::PipelineManager)
//!   that reconfigures them at runtime.
//! - [`engine`]: the [`Engine`](engine::Engine) handle that runs a flow.

pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod operator;
pub mod partition;
pub mod pipeline;
pub mod region;
pub mod tuplequeue;
pub mod types;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
