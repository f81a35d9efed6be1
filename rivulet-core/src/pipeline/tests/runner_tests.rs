use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::bail;

use crate::pipeline::{PipelineId, SendPolicy};
use crate::tuplequeue::{FailureFlag, Inbox};
use crate::types::Tuple;

const WAIT: Duration = Duration::from_secs(5);

fn replica_id() -> PipelineReplicaId {
    PipelineReplicaId::new(PipelineId::new(1, 0), 0)
}

fn config() -> RunnerConfig {
    RunnerConfig {
        wait_timeout_ms: 1,
        idle_backoff_us: 100,
    }
}

struct FakePipeline {
    invocations: Arc<AtomicUsize>,
    complete_after: Option<usize>,
    fail_at: Option<usize>,
    emit: bool,
    upstream_context: Arc<UpstreamContext>,
}

impl FakePipeline {
    fn new() -> Self {
        Self {
            invocations: Arc::new(AtomicUsize::new(0)),
            complete_after: None,
            fail_at: None,
            emit: false,
            upstream_context: Arc::new(UpstreamContext::initial(1)),
        }
    }

    fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl RunnablePipeline for FakePipeline {
    fn id(&self) -> PipelineReplicaId {
        replica_id()
    }

    fn invoke(&mut self) -> Result<Option<Tuples>> {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at == Some(n) {
            bail!("invocation {} failed", n);
        }
        if !self.emit {
            return Ok(None);
        }
        let mut output = Tuples::new(1);
        output.add(0, Tuple::new().with("n", n as i64));
        Ok(Some(output))
    }

    fn is_completed(&self) -> bool {
        self.complete_after.is_some_and(|limit| self.count() >= limit)
    }

    fn set_upstream_context(&mut self, upstream_context: Arc<UpstreamContext>) {
        self.upstream_context = upstream_context;
    }

    fn upstream_context(&self) -> &Arc<UpstreamContext> {
        &self.upstream_context
    }
}

struct FakeSupervisor {
    upstream_context: Mutex<Arc<UpstreamContext>>,
    sender: Mutex<Arc<DownstreamSender>>,
    fail_lookups: AtomicBool,
    completed: Mutex<Vec<PipelineReplicaId>>,
    failed: Mutex<Vec<(PipelineReplicaId, String)>>,
}

impl FakeSupervisor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            upstream_context: Mutex::new(Arc::new(UpstreamContext::initial(1))),
            sender: Mutex::new(Arc::new(DownstreamSender::Noop)),
            fail_lookups: AtomicBool::new(false),
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
        })
    }
}

impl Supervisor for FakeSupervisor {
    fn get_upstream_context(&self, _id: PipelineReplicaId) -> Result<Arc<UpstreamContext>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            bail!("lookup failed");
        }
        Ok(Arc::clone(&self.upstream_context.lock().unwrap()))
    }

    fn get_downstream_sender(&self, _id: PipelineReplicaId) -> Result<Arc<DownstreamSender>> {
        Ok(Arc::clone(&self.sender.lock().unwrap()))
    }

    fn notify_pipeline_replica_completed(&self, id: PipelineReplicaId) {
        self.completed.lock().unwrap().push(id);
    }

    fn notify_pipeline_replica_failed(&self, id: PipelineReplicaId, error: anyhow::Error) {
        self.failed.lock().unwrap().push((id, error.to_string()));
    }
}

fn runner(pipeline: FakePipeline, supervisor: &Arc<FakeSupervisor>) -> PipelineReplicaRunner<FakePipeline> {
    let supervisor: Arc<dyn Supervisor> = supervisor.clone();
    PipelineReplicaRunner::new(pipeline, supervisor, config()).unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + WAIT;
    while !condition() {
        assert!(std::time::Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_pause_then_resume_before_start_keeps_running() {
    let supervisor = FakeSupervisor::new();
    let pipeline = FakePipeline::new();
    let invocations = Arc::clone(&pipeline.invocations);
    let runner = runner(pipeline, &supervisor);
    let handle = runner.handle();

    let pause = handle.pause();
    assert!(!pause.is_done());
    let resume = handle.resume();
    assert_eq!(pause.try_result(), Some(Ok(())));
    assert_eq!(resume.wait(), Ok(()));

    let (_, join) = runner.spawn().unwrap();
    wait_until(|| invocations.load(Ordering::SeqCst) > 5);
    assert_eq!(handle.status(), RunnerStatus::Running);

    assert_eq!(handle.stop().wait(), Ok(()));
    join.join().unwrap();
}

#[test]
fn test_stop_while_running() {
    let supervisor = FakeSupervisor::new();
    let pipeline = FakePipeline::new();
    let invocations = Arc::clone(&pipeline.invocations);
    let (handle, join) = runner(pipeline, &supervisor).spawn().unwrap();
    wait_until(|| invocations.load(Ordering::SeqCst) > 0);

    assert_eq!(handle.stop().wait(), Ok(()));
    assert_eq!(handle.status(), RunnerStatus::Completed);
    join.join().unwrap();

    // stopped, not completed on its own
    assert!(supervisor.completed.lock().unwrap().is_empty());
    assert!(matches!(handle.pause().wait(), Err(EngineError::IllegalState(_))));
    assert!(matches!(handle.resume().wait(), Err(EngineError::IllegalState(_))));
    assert_eq!(handle.stop().wait(), Ok(()));
}

#[test]
fn test_stop_while_paused() {
    let supervisor = FakeSupervisor::new();
    let (handle, join) = runner(FakePipeline::new(), &supervisor).spawn().unwrap();

    assert_eq!(handle.pause().wait_timeout(WAIT), Some(Ok(())));
    assert_eq!(handle.status(), RunnerStatus::Paused);
    assert_eq!(handle.pause().try_result(), Some(Ok(())));

    assert_eq!(handle.stop().wait_timeout(WAIT), Some(Ok(())));
    assert_eq!(handle.status(), RunnerStatus::Completed);
    join.join().unwrap();
}

#[test]
fn test_paused_runner_does_not_invoke() {
    let supervisor = FakeSupervisor::new();
    let pipeline = FakePipeline::new();
    let invocations = Arc::clone(&pipeline.invocations);
    let (handle, join) = runner(pipeline, &supervisor).spawn().unwrap();

    assert_eq!(handle.pause().wait_timeout(WAIT), Some(Ok(())));
    let paused_at = invocations.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(invocations.load(Ordering::SeqCst), paused_at);

    assert_eq!(handle.resume().wait_timeout(WAIT), Some(Ok(())));
    wait_until(|| invocations.load(Ordering::SeqCst) > paused_at);

    handle.stop().wait().unwrap();
    join.join().unwrap();
}

#[test]
fn test_stop_supersedes_pending_pause() {
    let supervisor = FakeSupervisor::new();
    let runner = runner(FakePipeline::new(), &supervisor);
    let handle = runner.handle();

    let pause = handle.pause();
    let stop = handle.stop();
    let pipeline = runner.run();

    assert_eq!(pause.wait(), Ok(()));
    assert_eq!(stop.wait(), Ok(()));
    assert_eq!(pipeline.count(), 0);
    assert_eq!(handle.status(), RunnerStatus::Completed);
}

#[test]
fn test_pause_against_pending_stop_fails() {
    let supervisor = FakeSupervisor::new();
    let runner = runner(FakePipeline::new(), &supervisor);
    let handle = runner.handle();

    let stop = handle.stop();
    let pause = handle.pause();
    let resume = handle.resume();
    assert!(!pause.is_done());
    runner.run();

    assert_eq!(stop.wait(), Ok(()));
    assert!(matches!(pause.wait(), Err(EngineError::IllegalState(_))));
    assert!(matches!(resume.wait(), Err(EngineError::IllegalState(_))));
}

#[test]
fn test_update_refreshes_upstream_context() {
    let supervisor = FakeSupervisor::new();
    let (handle, join) = runner(FakePipeline::new(), &supervisor).spawn().unwrap();

    *supervisor.upstream_context.lock().unwrap() =
        Arc::new(UpstreamContext::initial(1).with_closed_upstream_connection(0));
    assert_eq!(handle.update_pipeline_upstream_context().wait_timeout(WAIT), Some(Ok(())));

    handle.stop().wait().unwrap();
    let pipeline = join.join().unwrap();
    assert_eq!(pipeline.upstream_context().version(), 1);
}

#[test]
fn test_update_coalesces_and_is_upgraded_by_pause() {
    let supervisor = FakeSupervisor::new();
    let runner = runner(FakePipeline::new(), &supervisor);
    let handle = runner.handle();

    let first = handle.update_pipeline_upstream_context();
    let second = handle.update_pipeline_upstream_context();
    let pause = handle.pause();
    let (_, join) = runner.spawn().unwrap();

    assert_eq!(first.wait_timeout(WAIT), Some(Ok(())));
    assert_eq!(second.wait_timeout(WAIT), Some(Ok(())));
    assert_eq!(pause.wait_timeout(WAIT), Some(Ok(())));
    assert_eq!(handle.status(), RunnerStatus::Paused);

    handle.stop().wait().unwrap();
    join.join().unwrap();
}

#[test]
fn test_self_completion_notifies_supervisor() {
    let supervisor = FakeSupervisor::new();
    let mut pipeline = FakePipeline::new();
    pipeline.complete_after = Some(3);
    let runner = runner(pipeline, &supervisor);
    let handle = runner.handle();

    let pipeline = runner.run();
    assert_eq!(pipeline.count(), 3);
    assert_eq!(handle.status(), RunnerStatus::Completed);
    assert_eq!(*supervisor.completed.lock().unwrap(), vec![replica_id()]);
    assert!(matches!(
        handle.update_pipeline_upstream_context().wait(),
        Err(EngineError::IllegalState(_))
    ));
}

#[test]
fn test_invocation_failure_is_reported() {
    let supervisor = FakeSupervisor::new();
    let mut pipeline = FakePipeline::new();
    pipeline.fail_at = Some(2);
    let runner = runner(pipeline, &supervisor);
    let handle = runner.handle();

    runner.run();
    assert_eq!(handle.status(), RunnerStatus::Completed);
    let failed = supervisor.failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].1, "invocation 2 failed");
    assert!(supervisor.completed.lock().unwrap().is_empty());
}

#[test]
fn test_pending_command_fails_with_replica_failure() {
    let supervisor = FakeSupervisor::new();
    supervisor.fail_lookups.store(true, Ordering::SeqCst);
    let runner = runner(FakePipeline::new(), &supervisor);
    let handle = runner.handle();

    let update = handle.update_pipeline_upstream_context();
    runner.run();
    assert!(matches!(update.wait(), Err(EngineError::ReplicaFailed { .. })));
    assert_eq!(supervisor.failed.lock().unwrap().len(), 1);
}

#[test]
fn test_output_is_forwarded_downstream() {
    let supervisor = FakeSupervisor::new();
    let inbox = Inbox::new(1024);
    *supervisor.sender.lock().unwrap() = Arc::new(DownstreamSender::Direct {
        ports: vec![(0, 0)],
        target: inbox.sender(),
        policy: SendPolicy::new(FailureFlag::new(), Duration::from_millis(5)),
    });
    let mut pipeline = FakePipeline::new();
    pipeline.emit = true;
    pipeline.complete_after = Some(4);

    runner(pipeline, &supervisor).run();
    let values: Vec<i64> = inbox
        .drain()
        .into_iter()
        .flat_map(|batch| batch.tuples)
        .map(|t| t.get_int("n").unwrap())
        .collect();
    assert_eq!(values, vec![1, 2, 3, 4]);
}
