//! # Pipeline replica runner
//!
//! Drives one pipeline replica on a dedicated thread and accepts commands from
//! the control plane through a [`RunnerHandle`].
//!
//! ```text
//! RUNNING <──pause/resume──> PAUSED
//!    │                          │
//!    └──stop / self-completion / failure──> COMPLETED (terminal)
//! ```
//!
//! At most one command is pending at a time. A command issued while another is
//! pending is merged into it:
//!
//! | issued \ pending | PAUSE    | RESUME          | UPDATE            | STOP              |
//! |------------------|----------|-----------------|-------------------|-------------------|
//! | pause            | joins    | cancels, ok     | upgraded to PAUSE | fails when done   |
//! | resume           | cancels  | joins           | upgraded to RESUME| fails when done   |
//! | stop             | → STOP   | → STOP          | → STOP            | joins             |
//! | update           | joins    | joins           | joins             | joins             |
//!
//! Applying any command re-reads the upstream context and the downstream
//! sender from the [`Supervisor`], so a PAUSE that absorbed an UPDATE still
//! performs the update.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error, info};

use crate::completion::{Completer, Completion};
use crate::config::RunnerConfig;
use crate::error::EngineError;
use crate::types::Tuples;

use super::{DownstreamSender, PipelineReplicaId, Supervisor, UpstreamContext};

/// What a runner needs from the pipeline it drives.
pub trait RunnablePipeline: Send + 'static {
    fn id(&self) -> PipelineReplicaId;

    /// Runs one invocation round; returns the output of the last operator.
    fn invoke(&mut self) -> Result<Option<Tuples>>;

    /// True once every operator completed.
    fn is_completed(&self) -> bool;

    fn set_upstream_context(&mut self, upstream_context: Arc<UpstreamContext>);

    fn upstream_context(&self) -> &Arc<UpstreamContext>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerStatus {
    Running,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Pause,
    Resume,
    Stop,
    UpdateUpstream,
}

#[derive(Debug)]
struct PendingCommand {
    kind: CommandKind,
    /// Resolved successfully once `kind` is applied.
    completers: Vec<Completer<()>>,
    /// Pause/resume issued against a pending stop; failed once it is applied.
    rejected: Vec<Completer<()>>,
}

impl PendingCommand {
    fn new(kind: CommandKind, completer: Completer<()>) -> Self {
        Self {
            kind,
            completers: vec![completer],
            rejected: Vec::new(),
        }
    }

    fn succeed(self, rejection: impl Fn() -> EngineError) {
        for completer in self.completers {
            completer.succeed(());
        }
        for completer in self.rejected {
            completer.fail(rejection());
        }
    }

    fn fail(self, error: &EngineError) {
        for completer in self.completers.into_iter().chain(self.rejected) {
            completer.fail(error.clone());
        }
    }
}

#[derive(Debug)]
struct RunnerState {
    status: RunnerStatus,
    pending: Option<PendingCommand>,
}

#[derive(Debug)]
struct RunnerControl {
    state: Mutex<RunnerState>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl RunnerControl {
    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().expect("runner state poisoned")
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn wait(&self, timeout: Duration) {
        let _ = self.wake_rx.recv_timeout(timeout);
    }
}

/// Control-plane handle of a runner. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    id: PipelineReplicaId,
    control: Arc<RunnerControl>,
}

impl RunnerHandle {
    pub fn id(&self) -> PipelineReplicaId {
        self.id
    }

    pub fn status(&self) -> RunnerStatus {
        self.control.lock().status
    }

    pub fn pause(&self) -> Completion<()> {
        self.toggle(CommandKind::Pause, RunnerStatus::Paused)
    }

    pub fn resume(&self) -> Completion<()> {
        self.toggle(CommandKind::Resume, RunnerStatus::Running)
    }

    fn toggle(&self, kind: CommandKind, target: RunnerStatus) -> Completion<()> {
        let mut state = self.control.lock();
        if state.status == RunnerStatus::Completed {
            return Completion::ready(Err(self.completed_error(kind)));
        }
        let (completer, completion) = Completion::pending();
        match state.pending.take() {
            None if state.status == target => return Completion::ready(Ok(())),
            None => {
                state.pending = Some(PendingCommand::new(kind, completer));
                drop(state);
                self.control.wake();
            }
            Some(mut pending) if pending.kind == kind => {
                pending.completers.push(completer);
                state.pending = Some(pending);
            }
            Some(mut pending) if pending.kind == CommandKind::Stop => {
                pending.rejected.push(completer);
                state.pending = Some(pending);
            }
            Some(mut pending) if pending.kind == CommandKind::UpdateUpstream => {
                pending.kind = kind;
                pending.completers.push(completer);
                state.pending = Some(pending);
            }
            Some(cancelled) => {
                // the opposite toggle is pending: both cancel out
                drop(state);
                debug!(replica = %self.id, ?kind, "cancelled pending opposite command");
                cancelled.succeed(|| self.completed_error(kind));
                return Completion::ready(Ok(()));
            }
        }
        completion
    }

    /// Completes the runner. Supersedes any pending pause, resume or update.
    pub fn stop(&self) -> Completion<()> {
        let mut state = self.control.lock();
        if state.status == RunnerStatus::Completed && state.pending.is_none() {
            return Completion::ready(Ok(()));
        }
        let (completer, completion) = Completion::pending();
        match state.pending.as_mut() {
            Some(pending) => {
                pending.kind = CommandKind::Stop;
                pending.completers.push(completer);
            }
            None => state.pending = Some(PendingCommand::new(CommandKind::Stop, completer)),
        }
        drop(state);
        self.control.wake();
        completion
    }

    /// Makes the runner re-read its upstream context and downstream sender.
    pub fn update_pipeline_upstream_context(&self) -> Completion<()> {
        let mut state = self.control.lock();
        if state.status == RunnerStatus::Completed {
            return Completion::ready(Err(self.completed_error(CommandKind::UpdateUpstream)));
        }
        let (completer, completion) = Completion::pending();
        match state.pending.as_mut() {
            Some(pending) => pending.completers.push(completer),
            None => {
                state.pending = Some(PendingCommand::new(CommandKind::UpdateUpstream, completer));
                drop(state);
                self.control.wake();
            }
        }
        completion
    }

    fn completed_error(&self, kind: CommandKind) -> EngineError {
        EngineError::illegal_state(format!(
            "cannot {:?} pipeline replica {}: runner is completed",
            kind, self.id
        ))
    }
}

/// Runs a [`RunnablePipeline`] until it completes, is stopped, or fails.
/// The pipeline is handed back when the loop exits.
pub struct PipelineReplicaRunner<P: RunnablePipeline> {
    id: PipelineReplicaId,
    control: Arc<RunnerControl>,
    pipeline: P,
    supervisor: Arc<dyn Supervisor>,
    downstream: Arc<DownstreamSender>,
    config: RunnerConfig,
}

impl<P: RunnablePipeline> PipelineReplicaRunner<P> {
    /// New runner in `RUNNING` status. Nothing executes until [`run`](Self::run)
    /// or [`spawn`](Self::spawn).
    pub fn new(pipeline: P, supervisor: Arc<dyn Supervisor>, config: RunnerConfig) -> Result<Self> {
        let id = pipeline.id();
        let downstream = supervisor.get_downstream_sender(id)?;
        let (wake_tx, wake_rx) = bounded(1);
        Ok(Self {
            id,
            control: Arc::new(RunnerControl {
                state: Mutex::new(RunnerState {
                    status: RunnerStatus::Running,
                    pending: None,
                }),
                wake_tx,
                wake_rx,
            }),
            pipeline,
            supervisor,
            downstream,
            config,
        })
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            id: self.id,
            control: Arc::clone(&self.control),
        }
    }

    /// Starts the loop on a new thread named after the replica.
    pub fn spawn(self) -> Result<(RunnerHandle, JoinHandle<P>)> {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name(self.id.to_string())
            .spawn(move || self.run())
            .with_context(|| format!("failed to spawn runner thread for {}", handle.id()))?;
        Ok((handle, join))
    }

    /// Runs the loop on the current thread.
    pub fn run(mut self) -> P {
        info!(replica = %self.id, "runner started");
        loop {
            if let Err(err) = self.apply_pending_command() {
                self.fail(err);
                break;
            }
            let status = self.control.lock().status;
            match status {
                RunnerStatus::Running => {
                    if let Err(err) = self.step() {
                        self.fail(err);
                        break;
                    }
                }
                RunnerStatus::Paused => self.control.wait(self.config.wait_timeout()),
                RunnerStatus::Completed => {
                    self.complete_run();
                    break;
                }
            }
        }
        info!(replica = %self.id, "runner exited");
        self.pipeline
    }

    fn step(&mut self) -> Result<()> {
        match self.pipeline.invoke()? {
            Some(output) => self.downstream.send(&output)?,
            None => thread::sleep(self.config.idle_backoff()),
        }
        if self.pipeline.is_completed() {
            debug!(replica = %self.id, "pipeline operators completed");
            self.control.lock().status = RunnerStatus::Completed;
        }
        Ok(())
    }

    fn apply_pending_command(&mut self) -> Result<()> {
        let mut state = self.control.lock();
        let Some(kind) = state.pending.as_ref().map(|pending| pending.kind) else {
            return Ok(());
        };
        if state.status == RunnerStatus::Completed {
            return Ok(());
        }
        if kind == CommandKind::Stop {
            // resolved in complete_run, without touching the wiring that may be gone
            state.status = RunnerStatus::Completed;
            return Ok(());
        }

        let upstream_context = self.supervisor.get_upstream_context(self.id)?;
        if **self.pipeline.upstream_context() != *upstream_context {
            debug!(
                replica = %self.id,
                version = upstream_context.version(),
                "updating upstream context"
            );
        }
        self.pipeline.set_upstream_context(upstream_context);
        self.downstream = self.supervisor.get_downstream_sender(self.id)?;

        match kind {
            CommandKind::Pause => state.status = RunnerStatus::Paused,
            CommandKind::Resume => state.status = RunnerStatus::Running,
            CommandKind::UpdateUpstream | CommandKind::Stop => {}
        }
        let applied = state.pending.take();
        let status = state.status;
        drop(state);
        debug!(replica = %self.id, ?kind, ?status, "applied command");
        if let Some(applied) = applied {
            applied.succeed(|| self.rejected_by_stop());
        }
        Ok(())
    }

    fn complete_run(&mut self) {
        if self.pipeline.is_completed() {
            self.supervisor.notify_pipeline_replica_completed(self.id);
        }
        let pending = self.control.lock().pending.take();
        match pending {
            Some(command) if command.kind == CommandKind::Stop => {
                info!(replica = %self.id, "runner stopped");
                command.succeed(|| self.rejected_by_stop());
            }
            Some(command) => {
                let error = EngineError::illegal_state(format!(
                    "pipeline replica {} completed before {:?} was applied",
                    self.id, command.kind
                ));
                command.fail(&error);
            }
            None => info!(replica = %self.id, "runner completed"),
        }
    }

    fn fail(&mut self, err: anyhow::Error) {
        error!(replica = %self.id, error = %format!("{:#}", err), "pipeline replica failed");
        let error = EngineError::ReplicaFailed {
            replica: self.id.to_string(),
            reason: format!("{:#}", err),
        };
        self.supervisor.notify_pipeline_replica_failed(self.id, err);
        let pending = {
            let mut state = self.control.lock();
            state.status = RunnerStatus::Completed;
            state.pending.take()
        };
        if let Some(command) = pending {
            command.fail(&error);
        }
    }

    fn rejected_by_stop(&self) -> EngineError {
        EngineError::illegal_state(format!("pipeline replica {} is stopping", self.id))
    }
}

#[cfg(test)]
#[path = "tests/runner_tests.rs"]
mod tests;
