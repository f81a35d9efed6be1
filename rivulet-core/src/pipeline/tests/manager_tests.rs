use super::*;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};

use crate::flow::FlowDefBuilder;
use crate::operator::{
    InitContext, InvocationContext, Operator, OperatorDef, OperatorType, SchedulingStrategy,
    TupleAvailabilityByCount, builtin,
};
use crate::region::{RegionDefFormer, StaticRegionExecutionPlanFactory};
use crate::types::Tuple;

const KEYS: i64 = 8;

/// Stamps every tuple with the running count of its key.
struct RunningCount;

impl Operator for RunningCount {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::on_any_port(TupleAvailabilityByCount::AtLeast, 1, 1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        let input = ctx.input.take(0);
        let kv = ctx.kv()?;
        let mut count = kv.get_int_or("count", 0);
        let mut stamped = Vec::with_capacity(input.len());
        for mut tuple in input {
            count += 1;
            tuple.set("count", count);
            stamped.push(tuple);
        }
        kv.set("count", count);
        for tuple in stamped {
            ctx.emit(0, tuple);
        }
        Ok(())
    }
}

/// [`RunningCount`] that fails on its `fail_at`-th invocation.
struct FailingCount {
    inner: RunningCount,
    invocations: usize,
    fail_at: usize,
}

impl Operator for FailingCount {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        self.inner.init(ctx)
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        self.invocations += 1;
        if self.invocations == self.fail_at {
            bail!("count failed on invocation {}", self.invocations);
        }
        self.inner.invoke(ctx)
    }
}

/// [`RunningCount`] that refuses to initialize more than `limit` replicas in total.
struct LimitedCount {
    inner: RunningCount,
    inits: Arc<AtomicUsize>,
    limit: usize,
}

impl Operator for LimitedCount {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        let previous = self.inits.fetch_add(1, Ordering::SeqCst);
        ensure!(previous < self.limit, "only {} count replicas may exist", self.limit);
        self.inner.init(ctx)
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        self.inner.invoke(ctx)
    }
}

fn count_def<F>(factory: F) -> OperatorDef
where
    F: Fn() -> Box<dyn Operator> + Send + Sync + 'static,
{
    OperatorDef::new("count", OperatorType::PartitionedStateful, factory).with_partition_fields(["key"])
}

struct Harness {
    manager: PipelineManager,
    notifications: Receiver<ReplicaNotification>,
    emitted: Arc<AtomicI64>,
    collected: Arc<Mutex<Vec<Tuple>>>,
}

impl Harness {
    fn start(split_pipelines: bool) -> Self {
        Self::start_with(count_def(|| Box::new(RunningCount)), split_pipelines, config())
    }

    /// `src -> count -> tag -> collect`, with `count` and `tag` in one partitioned region.
    fn start_with(count: OperatorDef, split_pipelines: bool, config: EngineConfig) -> Self {
        let emitted = Arc::new(AtomicI64::new(0));
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sequence = Arc::clone(&emitted);
        let sink = Arc::clone(&collected);

        let mut builder = FlowDefBuilder::new();
        builder
            .add(builtin::beacon("src", 4, move |t| {
                let n = sequence.fetch_add(1, Ordering::SeqCst);
                t.set("key", n % KEYS);
            }))
            .unwrap()
            .add(count)
            .unwrap()
            .add(builtin::mapper("tag", |t| t.clone().with("tagged", true)).with_input_fields(["key", "count"]))
            .unwrap()
            .add(builtin::for_each("collect", move |t| {
                sink.lock().unwrap().push(t.clone());
            }))
            .unwrap()
            .connect("src", "count")
            .unwrap()
            .connect("count", "tag")
            .unwrap()
            .connect("tag", "collect")
            .unwrap();
        let flow = Arc::new(builder.build().unwrap());

        let regions = RegionDefFormer::new().create_regions(&flow).unwrap();
        let plans = StaticRegionExecutionPlanFactory::new(2)
            .with_pipeline_split(split_pipelines)
            .create_region_execution_plans(regions)
            .unwrap();

        let (tx, notifications) = unbounded();
        let mut manager = PipelineManager::new(config, Arc::new(PipelineRegistry::new(tx)));
        manager.start(flow, plans).unwrap();
        Self {
            manager,
            notifications,
            emitted,
            collected,
        }
    }

    fn shutdown(&mut self) {
        self.manager.trigger_shutdown().unwrap();
        self.await_shutdown();
    }

    fn await_shutdown(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.manager.status() != FlowStatus::ShutDown {
            assert!(Instant::now() < deadline, "flow did not shut down");
            if let Ok(notification) = self.notifications.recv_timeout(Duration::from_millis(50)) {
                self.manager.handle_notification(notification);
            }
        }
    }

    /// Every emitted tuple arrived, and the last count of each key equals
    /// the number of its tuples.
    fn assert_complete_and_consistent(&self) {
        let collected = self.collected.lock().unwrap();
        assert_eq!(collected.len() as i64, self.emitted.load(Ordering::SeqCst));
        let mut seen: HashMap<i64, (i64, i64)> = HashMap::new();
        for tuple in collected.iter() {
            let entry = seen.entry(tuple.get_int("key").unwrap()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(tuple.get_int("count").unwrap());
        }
        for (key, (tuples, max_count)) in seen {
            assert_eq!(tuples, max_count, "key {}", key);
        }
    }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.partition.partition_count = 16;
    config.partition.shuffle_seed = Some(11);
    config.manager.runner_command_timeout_ms = 5_000;
    config
}

fn let_it_run() {
    thread::sleep(Duration::from_millis(30));
}

#[test]
fn test_start_and_shutdown() {
    let mut harness = Harness::start(false);
    assert_eq!(harness.manager.status(), FlowStatus::Running);
    assert_eq!(harness.manager.version(), 1);
    let summary = harness.manager.flow_execution_plan().unwrap().summary();
    let replicas: Vec<usize> = summary.regions.iter().map(|r| r.replica_count).collect();
    assert_eq!(replicas, vec![1, 2, 1]);
    assert_eq!(summary.regions[1].pipelines, vec![vec!["count".to_string(), "tag".to_string()]]);

    let_it_run();
    harness.shutdown();
    assert!(!harness.manager.failure_flag().is_set());
    assert!(!harness.collected.lock().unwrap().is_empty());
    harness.assert_complete_and_consistent();
}

#[test]
fn test_start_twice_fails() {
    let mut harness = Harness::start(false);
    let flow = Arc::clone(harness.manager.flow_execution_plan().unwrap().flow());
    let again = harness.manager.start(flow, Vec::new());
    assert!(matches!(again, Err(EngineError::IllegalState(_))));
    harness.shutdown();
}

#[test]
fn test_reconfiguration_preconditions() {
    let mut harness = Harness::start(true);
    let manager = &mut harness.manager;
    let count = PipelineId::new(1, 0);
    let tag = PipelineId::new(1, 1);

    let stale = manager.merge_pipelines(0, vec![count, tag]);
    assert!(matches!(stale, Err(EngineError::IllegalArgument(_))));
    let single = manager.merge_pipelines(1, vec![count]);
    assert!(matches!(single, Err(EngineError::IllegalArgument(_))));
    let one_operator = manager.split_pipeline(1, PipelineId::new(0, 0), vec![1]);
    assert!(matches!(one_operator, Err(EngineError::IllegalArgument(_))));
    let stateless = manager.rebalance_region(1, 0, 2);
    assert!(matches!(stateless, Err(EngineError::IllegalArgument(_))));
    let unchanged = manager.rebalance_region(1, 1, 2);
    assert!(matches!(unchanged, Err(EngineError::IllegalArgument(_))));
    let too_many = manager.rebalance_region(1, 1, 17);
    assert!(matches!(too_many, Err(EngineError::IllegalArgument(_))));
    assert_eq!(manager.version(), 1);

    harness.shutdown();
    let after = harness.manager.merge_pipelines(1, vec![count, tag]);
    assert!(matches!(after, Err(EngineError::IllegalState(_))));
}

#[test]
fn test_merge_then_split_keeps_every_tuple() {
    let mut harness = Harness::start(true);
    let count = PipelineId::new(1, 0);
    let tag = PipelineId::new(1, 1);
    let_it_run();

    let merged = harness.manager.merge_pipelines(1, vec![tag, count]).unwrap();
    assert_eq!(merged.version(), 2);
    assert_eq!(merged.region_execution_plan(1).unwrap().pipeline_start_indices(), &[0]);
    let_it_run();

    let split = harness.manager.split_pipeline(2, count, vec![1]).unwrap();
    assert_eq!(split.version(), 3);
    assert_eq!(split.region_execution_plan(1).unwrap().pipeline_ids(), vec![count, tag]);
    let_it_run();

    harness.shutdown();
    harness.assert_complete_and_consistent();
}

#[test]
fn test_rebalance_keeps_partition_state() {
    let mut harness = Harness::start(false);
    let_it_run();

    let grown = harness.manager.rebalance_region(1, 1, 4).unwrap();
    assert_eq!(grown.version(), 2);
    assert_eq!(grown.region_execution_plan(1).unwrap().replica_count(), 4);
    let_it_run();

    let shrunk = harness.manager.rebalance_region(2, 1, 1).unwrap();
    assert_eq!(shrunk.region_execution_plan(1).unwrap().replica_count(), 1);
    let_it_run();

    harness.shutdown();
    harness.assert_complete_and_consistent();
}

#[test]
fn test_replica_failure_shuts_down_flow() {
    let mut config = config();
    // a small inbox makes the source block on the failed replica
    config.queue.tuple_queue_capacity = 2;
    let count = count_def(|| {
        Box::new(FailingCount {
            inner: RunningCount,
            invocations: 0,
            fail_at: 3,
        })
    });
    let mut harness = Harness::start_with(count, false, config);

    let started = Instant::now();
    harness.await_shutdown();
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "blocked senders did not fail fast: {:?}",
        started.elapsed()
    );
    assert!(harness.manager.failure_flag().is_set());
    assert_eq!(harness.manager.version(), 1);
    let merge = harness.manager.merge_pipelines(1, vec![PipelineId::new(1, 0)]);
    assert!(matches!(merge, Err(EngineError::IllegalState(_))));
}

#[test]
fn test_failed_rebalance_keeps_version_and_resumes_upstream() {
    let inits = Arc::new(AtomicUsize::new(0));
    let shared = Arc::clone(&inits);
    let count = count_def(move || {
        Box::new(LimitedCount {
            inner: RunningCount,
            inits: Arc::clone(&shared),
            limit: 2,
        })
    });
    let mut harness = Harness::start_with(count, false, config());
    assert_eq!(inits.load(Ordering::SeqCst), 2);
    let_it_run();

    let failed = harness.manager.rebalance_region(1, 1, 3);
    let Err(EngineError::Reconfiguration { operation, .. }) = failed else {
        panic!("expected a reconfiguration error, got {:?}", failed);
    };
    assert_eq!(operation, "rebalance region");
    assert_eq!(harness.manager.version(), 1);
    let plan = harness.manager.flow_execution_plan().unwrap();
    assert_eq!(plan.version(), 1);
    assert_eq!(plan.region_execution_plan(1).unwrap().replica_count(), 2);

    // the resumed source runs into the dropped region and fails the flow
    harness.await_shutdown();
    assert!(harness.manager.failure_flag().is_set());
}
