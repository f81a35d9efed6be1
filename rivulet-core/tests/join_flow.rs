mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{JoinFlow, config};
use rivulet_core::pipeline::{FlowStatus, PipelineId};
use rivulet_core::{Engine, EngineError};

const TIMEOUT: Duration = Duration::from_secs(20);
const JOIN_REGION: u32 = 2;

fn run(join: &JoinFlow, replica_count: usize, split_pipelines: bool) -> Engine {
    Engine::run(config(), Arc::clone(&join.flow), join.plans(replica_count, split_pipelines)).unwrap()
}

fn let_it_run() {
    thread::sleep(Duration::from_millis(50));
}

fn drain(engine: Engine, join: &JoinFlow) {
    engine.trigger_shutdown().unwrap();
    engine.await_termination(TIMEOUT).unwrap();
    assert_eq!(engine.status().unwrap(), FlowStatus::ShutDown);
    engine.shutdown(TIMEOUT).unwrap();
    join.assert_collected_matches_emitted();
}

#[test]
fn test_regions_of_join_flow() {
    let join = JoinFlow::new();
    let engine = run(&join, 2, false);
    let summary = engine.flow_execution_plan().unwrap().summary();
    assert_eq!(summary.version, 1);

    let layout: Vec<(usize, Vec<Vec<String>>)> = summary
        .regions
        .iter()
        .map(|r| (r.replica_count, r.pipelines.clone()))
        .collect();
    let ids = |ids: &[&str]| ids.iter().map(|id| id.to_string()).collect::<Vec<_>>();
    assert_eq!(
        layout,
        vec![
            (1, vec![ids(&["beacon1"])]),
            (1, vec![ids(&["beacon2"])]),
            (2, vec![ids(&["joiner", "summer", "multiplier"])]),
            (1, vec![ids(&["collector"])]),
        ]
    );
    drain(engine, &join);
}

#[test]
fn test_drains_without_reconfiguration() {
    let join = JoinFlow::new();
    let engine = run(&join, 4, false);
    let_it_run();
    drain(engine, &join);
}

#[test]
fn test_merge_pipelines_while_running() {
    let join = JoinFlow::new();
    let engine = run(&join, 2, true);
    let_it_run();

    let plan = engine
        .merge_pipelines(1, vec![PipelineId::new(JOIN_REGION, 0), PipelineId::new(JOIN_REGION, 1)])
        .wait()
        .unwrap();
    assert_eq!(plan.version(), 2);
    let region = plan.region_execution_plan(JOIN_REGION).unwrap();
    assert_eq!(region.pipeline_start_indices(), &[0]);
    let_it_run();
    drain(engine, &join);
}

#[test]
fn test_split_then_merge_restores_layout() {
    let join = JoinFlow::new();
    let engine = run(&join, 2, false);
    let initial = engine.flow_execution_plan().unwrap().summary();
    let_it_run();

    let split = engine
        .split_pipeline(1, PipelineId::new(JOIN_REGION, 0), vec![1, 2])
        .wait()
        .unwrap();
    let pipelines = split.region_execution_plan(JOIN_REGION).unwrap().pipeline_ids();
    assert_eq!(pipelines.len(), 3);
    let_it_run();

    let merged = engine.merge_pipelines(2, pipelines).wait().unwrap();
    assert_eq!(merged.version(), 3);
    let mut restored = merged.summary();
    restored.version = initial.version;
    assert_eq!(restored, initial);
    let_it_run();
    drain(engine, &join);
}

#[test]
fn test_rebalance_down_and_up() {
    let join = JoinFlow::new();
    let engine = run(&join, 4, false);
    let_it_run();

    let shrunk = engine.rebalance_region(1, JOIN_REGION, 2).wait().unwrap();
    assert_eq!(shrunk.region_execution_plan(JOIN_REGION).unwrap().replica_count(), 2);
    let_it_run();

    let grown = engine.rebalance_region(2, JOIN_REGION, 4).wait().unwrap();
    assert_eq!(grown.version(), 3);
    assert_eq!(grown.region_execution_plan(JOIN_REGION).unwrap().replica_count(), 4);
    let_it_run();
    drain(engine, &join);
}

#[test]
fn test_invalid_requests_leave_flow_untouched() {
    let join = JoinFlow::new();
    let engine = run(&join, 2, false);

    let stale = engine.rebalance_region(7, JOIN_REGION, 3).wait();
    assert!(matches!(stale, Err(EngineError::IllegalArgument(_))));
    let stateful = engine.rebalance_region(1, 3, 2).wait();
    assert!(matches!(stateful, Err(EngineError::IllegalArgument(_))));
    let across_regions = engine
        .merge_pipelines(1, vec![PipelineId::new(0, 0), PipelineId::new(JOIN_REGION, 0)])
        .wait();
    assert!(matches!(across_regions, Err(EngineError::IllegalArgument(_))));

    assert_eq!(engine.flow_execution_plan().unwrap().version(), 1);
    assert_eq!(engine.status().unwrap(), FlowStatus::Running);
    drain(engine, &join);
}

#[test]
fn test_shutdown_of_running_engine() {
    let join = JoinFlow::new();
    let engine = run(&join, 2, false);
    let_it_run();
    engine.shutdown(TIMEOUT).unwrap();
    join.assert_collected_matches_emitted();
}
