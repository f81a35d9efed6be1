//! # Engine
//!
//! Runs a flow in the current process. The [`PipelineManager`] lives on a
//! dedicated control thread that multiplexes two channels:
//!
//! ```text
//!  Engine handle ──commands──────┐
//!                                ├──> control thread ──> PipelineManager
//!  runners ──────notifications───┘
//! ```
//!
//! Control operations are answered through [`Completion`]s. Runner lookups
//! never reach the control thread; they are served by the shared
//! [`PipelineRegistry`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use tracing::{info, warn};

use crate::completion::{Completer, Completion};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::flow::FlowDef;
use crate::pipeline::{FlowStatus, PipelineId, PipelineManager, PipelineRegistry, ReplicaNotification};
use crate::region::{FlowExecutionPlan, RegionExecutionPlan, RegionId};

enum ControlCommand {
    Merge {
        flow_version: u64,
        pipeline_ids: Vec<PipelineId>,
        completer: Completer<FlowExecutionPlan>,
    },
    Split {
        flow_version: u64,
        pipeline_id: PipelineId,
        operator_indices: Vec<usize>,
        completer: Completer<FlowExecutionPlan>,
    },
    Rebalance {
        flow_version: u64,
        region_id: RegionId,
        replica_count: usize,
        completer: Completer<FlowExecutionPlan>,
    },
    Plan(Completer<FlowExecutionPlan>),
    Status(Completer<FlowStatus>),
    TriggerShutdown(Completer<()>),
    AwaitShutdown(Completer<()>),
}

/// Handle of a running flow. Dropping it shuts the flow down.
pub struct Engine {
    commands: Option<Sender<ControlCommand>>,
    control: Option<JoinHandle<()>>,
}

impl Engine {
    /// Starts `flow` laid out by `plans` and returns once every runner is up.
    pub fn run(config: EngineConfig, flow: Arc<FlowDef>, plans: Vec<RegionExecutionPlan>) -> EngineResult<Self> {
        let (notification_tx, notification_rx) = unbounded();
        let registry = Arc::new(PipelineRegistry::new(notification_tx));
        let mut manager = PipelineManager::new(config, registry);
        let plan = manager.start(flow, plans)?;
        info!(version = plan.version(), "engine started");

        let (command_tx, command_rx) = unbounded();
        let control = thread::Builder::new()
            .name("rivulet-control".to_string())
            .spawn(move || control_loop(manager, command_rx, notification_rx))
            .map_err(|err| EngineError::Initialization(format!("failed to spawn control thread: {}", err)))?;
        Ok(Self {
            commands: Some(command_tx),
            control: Some(control),
        })
    }

    pub fn merge_pipelines(&self, flow_version: u64, pipeline_ids: Vec<PipelineId>) -> Completion<FlowExecutionPlan> {
        self.request(|completer| ControlCommand::Merge {
            flow_version,
            pipeline_ids,
            completer,
        })
    }

    pub fn split_pipeline(
        &self,
        flow_version: u64,
        pipeline_id: PipelineId,
        operator_indices: Vec<usize>,
    ) -> Completion<FlowExecutionPlan> {
        self.request(|completer| ControlCommand::Split {
            flow_version,
            pipeline_id,
            operator_indices,
            completer,
        })
    }

    pub fn rebalance_region(
        &self,
        flow_version: u64,
        region_id: RegionId,
        replica_count: usize,
    ) -> Completion<FlowExecutionPlan> {
        self.request(|completer| ControlCommand::Rebalance {
            flow_version,
            region_id,
            replica_count,
            completer,
        })
    }

    pub fn flow_execution_plan(&self) -> EngineResult<FlowExecutionPlan> {
        self.request(ControlCommand::Plan).wait()
    }

    pub fn status(&self) -> EngineResult<FlowStatus> {
        self.request(ControlCommand::Status).wait()
    }

    /// Closes every source so the flow drains and shuts down on its own.
    pub fn trigger_shutdown(&self) -> EngineResult<()> {
        self.request(ControlCommand::TriggerShutdown).wait()
    }

    /// Waits until the flow is shut down.
    pub fn await_termination(&self, timeout: Duration) -> EngineResult<()> {
        self.request(ControlCommand::AwaitShutdown)
            .wait_timeout(timeout)
            .unwrap_or_else(|| {
                Err(EngineError::illegal_state(format!(
                    "flow did not shut down within {:?}",
                    timeout
                )))
            })
    }

    /// Triggers a shutdown if the flow is still running, waits for it and
    /// stops the control thread.
    pub fn shutdown(mut self, timeout: Duration) -> EngineResult<()> {
        if self.status()? == FlowStatus::Running {
            self.trigger_shutdown()?;
        }
        let result = self.await_termination(timeout);
        self.close();
        result
    }

    fn request<T>(&self, command: impl FnOnce(Completer<T>) -> ControlCommand) -> Completion<T> {
        let (completer, completion) = Completion::pending();
        let Some(commands) = &self.commands else {
            return Completion::ready(Err(EngineError::illegal_state("engine is closed")));
        };
        if commands.send(command(completer)).is_err() {
            return Completion::ready(Err(EngineError::illegal_state("control thread has exited")));
        }
        completion
    }

    fn close(&mut self) {
        self.commands.take();
        if let Some(control) = self.control.take() {
            if control.join().is_err() {
                warn!("control thread panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

fn control_loop(
    mut manager: PipelineManager,
    commands: Receiver<ControlCommand>,
    notifications: Receiver<ReplicaNotification>,
) {
    let mut shutdown_waiters: Vec<Completer<()>> = Vec::new();
    loop {
        select! {
            recv(notifications) -> notification => match notification {
                Ok(notification) => manager.handle_notification(notification),
                Err(_) => break,
            },
            recv(commands) -> command => match command {
                Ok(command) => handle_command(&mut manager, command, &mut shutdown_waiters),
                Err(_) => break,
            },
        }
        if is_terminal(manager.status()) {
            for waiter in shutdown_waiters.drain(..) {
                waiter.succeed(());
            }
        }
    }

    if !is_terminal(manager.status()) {
        let reason = anyhow!("engine closed while the flow was {:?}", manager.status());
        manager.shutdown_gracefully(Some(&reason));
    }
    for waiter in shutdown_waiters {
        waiter.succeed(());
    }
    info!("control thread exited");
}

fn handle_command(manager: &mut PipelineManager, command: ControlCommand, shutdown_waiters: &mut Vec<Completer<()>>) {
    match command {
        ControlCommand::Merge {
            flow_version,
            pipeline_ids,
            completer,
        } => completer.complete(manager.merge_pipelines(flow_version, pipeline_ids)),
        ControlCommand::Split {
            flow_version,
            pipeline_id,
            operator_indices,
            completer,
        } => completer.complete(manager.split_pipeline(flow_version, pipeline_id, operator_indices)),
        ControlCommand::Rebalance {
            flow_version,
            region_id,
            replica_count,
            completer,
        } => completer.complete(manager.rebalance_region(flow_version, region_id, replica_count)),
        ControlCommand::Plan(completer) => completer.complete(
            manager
                .flow_execution_plan()
                .ok_or_else(|| EngineError::illegal_state("no flow is started")),
        ),
        ControlCommand::Status(completer) => completer.succeed(manager.status()),
        ControlCommand::TriggerShutdown(completer) => completer.complete(manager.trigger_shutdown()),
        ControlCommand::AwaitShutdown(completer) => shutdown_waiters.push(completer),
    }
}

fn is_terminal(status: FlowStatus) -> bool {
    matches!(status, FlowStatus::ShutDown | FlowStatus::InitializationFailed)
}
