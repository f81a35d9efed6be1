//! Engine configuration.
//!
//! Every section has defaults, so a JSON file only needs to name the values it
//! overrides:
//!
//! ```json
//! { "partition": { "partition_count": 64, "shuffle_seed": 7 } }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub partition: PartitionConfig,
    pub runner: RunnerConfig,
    pub manager: ManagerConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Logical partitions of every partitioned region.
    pub partition_count: usize,
    /// Seed for the distribution shuffle. `None` draws from OS entropy.
    pub shuffle_seed: Option<u64>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_count: 271,
            shuffle_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Bounded wait of a paused runner before it re-checks its command.
    pub wait_timeout_ms: u64,
    /// Sleep after an invocation that produced nothing and left no input buffered.
    pub idle_backoff_us: u64,
}

impl RunnerConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_us)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 1,
            idle_backoff_us: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How long the manager waits for runners to acknowledge pause, resume or stop.
    pub runner_command_timeout_ms: u64,
}

impl ManagerConfig {
    pub fn runner_command_timeout(&self) -> Duration {
        Duration::from_millis(self.runner_command_timeout_ms)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            runner_command_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of a pipeline inbox, in batches. Also bounds the tuple counts
    /// an operator may require per port.
    pub tuple_queue_capacity: usize,
    /// How often a blocked downstream send re-checks the flow failure flag.
    pub send_retry_interval_ms: u64,
}

impl QueueConfig {
    pub fn send_retry_interval(&self) -> Duration {
        Duration::from_millis(self.send_retry_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tuple_queue_capacity: 1024,
            send_retry_interval_ms: 10,
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
