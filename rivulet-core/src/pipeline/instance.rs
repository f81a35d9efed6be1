//! Control-plane view of one pipeline: its replicas while they are idle, and
//! the handles and threads of their runners while they execute.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, ensure};
use tracing::{debug, warn};

use crate::completion::Completion;
use crate::config::RunnerConfig;
use crate::error::{EngineError, EngineResult};
use crate::operator::{OperatorDef, SchedulingStrategy};
use crate::tuplequeue::InboxSender;

use super::{
    DownstreamSender, PipelineId, PipelineReplica, PipelineReplicaRunner, PipelineWiring,
    RunnablePipeline, RunnerHandle, RunnerStatus, Supervisor, UpstreamContext,
};

struct RunningReplica {
    handle: RunnerHandle,
    thread: JoinHandle<PipelineReplica>,
}

pub struct Pipeline {
    id: PipelineId,
    operator_defs: Vec<Arc<OperatorDef>>,
    /// Held while no runner owns them.
    replicas: Vec<PipelineReplica>,
    runners: Vec<RunningReplica>,
    /// Inbox of each replica's first operator, by replica index.
    inbox_senders: Vec<InboxSender>,
    completed: Vec<bool>,
    initial_strategy: Option<SchedulingStrategy>,
    wiring: Arc<PipelineWiring>,
}

impl Pipeline {
    pub fn new(
        id: PipelineId,
        operator_defs: Vec<Arc<OperatorDef>>,
        replicas: Vec<PipelineReplica>,
        wiring: Arc<PipelineWiring>,
    ) -> Result<Self> {
        ensure!(!operator_defs.is_empty(), "pipeline {} has no operators", id);
        ensure!(!replicas.is_empty(), "pipeline {} has no replicas", id);
        let inbox_senders = replicas.iter().map(PipelineReplica::inbox_sender).collect();
        let completed = replicas.iter().map(RunnablePipeline::is_completed).collect();
        let initial_strategy = replicas[0].operators()[0].initial_strategy().cloned();
        Ok(Self {
            id,
            operator_defs,
            replicas,
            runners: Vec::new(),
            inbox_senders,
            completed,
            initial_strategy,
            wiring,
        })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn replica_count(&self) -> usize {
        self.inbox_senders.len()
    }

    pub fn operator_defs(&self) -> &[Arc<OperatorDef>] {
        &self.operator_defs
    }

    pub fn first_operator_def(&self) -> &Arc<OperatorDef> {
        &self.operator_defs[0]
    }

    pub fn last_operator_def(&self) -> &Arc<OperatorDef> {
        &self.operator_defs[self.operator_defs.len() - 1]
    }

    pub fn operator_index(&self, operator_id: &str) -> Option<usize> {
        self.operator_defs.iter().position(|op| op.id == operator_id)
    }

    pub fn inbox_senders(&self) -> &[InboxSender] {
        &self.inbox_senders
    }

    /// Scheduling strategy the first operator declared at init.
    pub fn initial_strategy(&self) -> Option<&SchedulingStrategy> {
        self.initial_strategy.as_ref()
    }

    /// Strategies declared by the operators of the idle replicas.
    pub fn operator_strategies(&self) -> impl Iterator<Item = (&str, &SchedulingStrategy)> {
        self.replicas
            .iter()
            .flat_map(|replica| replica.operators())
            .filter_map(|op| op.initial_strategy().map(|strategy| (op.operator_id(), strategy)))
    }

    pub fn wiring(&self) -> &Arc<PipelineWiring> {
        &self.wiring
    }

    pub fn upstream_context(&self) -> Arc<UpstreamContext> {
        self.wiring.upstream_context()
    }

    /// Publishes `upstream_context` to runners and hands it to idle replicas.
    pub fn set_upstream_context(&mut self, upstream_context: Arc<UpstreamContext>) {
        for replica in &mut self.replicas {
            replica.set_upstream_context(Arc::clone(&upstream_context));
        }
        self.wiring.set_upstream_context(upstream_context);
    }

    pub fn set_senders(&self, senders: Vec<Arc<DownstreamSender>>) {
        self.wiring.set_senders(senders);
    }

    /// Initializes the operators of every idle replica.
    pub fn init(&mut self) -> Result<()> {
        for replica in &mut self.replicas {
            replica.init()?;
        }
        self.initial_strategy = self
            .replicas
            .first()
            .and_then(|replica| replica.operators()[0].initial_strategy().cloned());
        Ok(())
    }

    pub fn start_runners(&mut self, supervisor: &Arc<dyn Supervisor>, config: &RunnerConfig) -> Result<()> {
        ensure!(self.runners.is_empty(), "runners of pipeline {} are already started", self.id);
        ensure!(
            self.replicas.len() == self.replica_count(),
            "pipeline {} holds {} of {} replicas",
            self.id,
            self.replicas.len(),
            self.replica_count()
        );
        for replica in std::mem::take(&mut self.replicas) {
            let runner = PipelineReplicaRunner::new(replica, Arc::clone(supervisor), config.clone())?;
            let (handle, thread) = runner.spawn()?;
            self.runners.push(RunningReplica { handle, thread });
        }
        debug!(pipeline = %self.id, replicas = self.runners.len(), "started runners");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        !self.runners.is_empty()
    }

    /// Every runner is `RUNNING` and no replica has completed.
    pub fn is_fully_running(&self) -> bool {
        self.is_started()
            && !self.completed.iter().any(|&completed| completed)
            && self
                .runners
                .iter()
                .all(|runner| runner.handle.status() == RunnerStatus::Running)
    }

    pub fn runner_statuses(&self) -> Vec<RunnerStatus> {
        self.runners.iter().map(|runner| runner.handle.status()).collect()
    }

    /// Pauses every runner. Runners that completed on their own are skipped.
    pub fn pause_runners(&self, timeout: Duration) -> EngineResult<()> {
        self.toggle_runners("pause", RunnerHandle::pause, timeout)
    }

    pub fn resume_runners(&self, timeout: Duration) -> EngineResult<()> {
        self.toggle_runners("resume", RunnerHandle::resume, timeout)
    }

    fn toggle_runners(
        &self,
        command: &str,
        issue: impl Fn(&RunnerHandle) -> Completion<()>,
        timeout: Duration,
    ) -> EngineResult<()> {
        let deadline = Instant::now() + timeout;
        let issued: Vec<_> = self.runners.iter().map(|r| (&r.handle, issue(&r.handle))).collect();
        for (handle, completion) in issued {
            match wait_until(&completion, deadline) {
                Some(Ok(())) => {}
                Some(Err(_)) if handle.status() == RunnerStatus::Completed => {
                    debug!(replica = %handle.id(), command, "runner already completed");
                }
                Some(Err(err)) => return Err(err),
                None => return Err(self.timed_out(command, timeout)),
            }
        }
        Ok(())
    }

    /// Asks every runner that has not completed to re-read its wiring.
    pub fn update_runners(&self) {
        for (runner, &completed) in self.runners.iter().zip(&self.completed) {
            if !completed {
                // the result only tells whether the runner completed meanwhile
                let _ = runner.handle.update_pipeline_upstream_context();
            }
        }
    }

    /// Stops every runner and takes its replica back. A runner that failed
    /// while stopping still hands its replica back.
    pub fn stop_runners(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let completions: Vec<_> = self.runners.iter().map(|r| r.handle.stop()).collect();
        for (runner, completion) in self.runners.iter().zip(&completions) {
            match wait_until(completion, deadline) {
                Some(Ok(())) => {}
                Some(Err(err)) => debug!(replica = %runner.handle.id(), error = %err, "runner ended while stopping"),
                None => return Err(self.timed_out("stop", timeout).into()),
            }
        }
        for runner in std::mem::take(&mut self.runners) {
            let replica_id = runner.handle.id();
            let replica = runner
                .thread
                .join()
                .map_err(|_| anyhow!("runner thread of {} panicked", replica_id))?;
            self.replicas.push(replica);
        }
        self.replicas.sort_by_key(|replica| replica.id().replica_index);
        debug!(pipeline = %self.id, "stopped runners");
        Ok(())
    }

    /// Idle replicas, leaving the pipeline empty.
    pub fn take_replicas(&mut self) -> Vec<PipelineReplica> {
        std::mem::take(&mut self.replicas)
    }

    /// Records that replica `replica_index` completed. Returns whether every
    /// replica has now completed.
    pub fn handle_replica_completed(&mut self, replica_index: usize) -> bool {
        match self.completed.get_mut(replica_index) {
            Some(completed) => *completed = true,
            None => warn!(pipeline = %self.id, replica_index, "completion of unknown replica"),
        }
        self.is_completed()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.iter().all(|&completed| completed)
    }

    pub fn shutdown_operators(&mut self) {
        for replica in &mut self.replicas {
            if let Err(err) = replica.shutdown_operators() {
                warn!(replica = %replica.id(), error = %err, "failed to shut down operators");
            }
        }
    }

    fn timed_out(&self, command: &str, timeout: Duration) -> EngineError {
        EngineError::illegal_state(format!(
            "{} of pipeline {} timed out after {:?}",
            command, self.id, timeout
        ))
    }
}

fn wait_until(completion: &Completion<()>, deadline: Instant) -> Option<EngineResult<()>> {
    completion.wait_timeout(deadline.saturating_duration_since(Instant::now()))
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("replicas", &self.replica_count())
            .field("started", &self.is_started())
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}
