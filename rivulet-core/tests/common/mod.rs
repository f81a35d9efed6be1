//! Join flow shared by the integration tests.
//!
//! ```text
//! beacon1 ──┐
//!           ├──> joiner ──> summer ──> multiplier ──> collector
//! beacon2 ──┘
//! ```
//!
//! The beacons emit keyed values and record what they emitted. `summer`
//! keeps a running sum per key, `multiplier` scales it by 100 and
//! `collector` keeps the largest value seen per key. Once the flow drains,
//! every collected value must be 100 times the sum of what was emitted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use rivulet_core::EngineConfig;
use rivulet_core::flow::{FlowDef, FlowDefBuilder};
use rivulet_core::operator::{
    InitContext, InvocationContext, Operator, OperatorDef, OperatorType, SchedulingStrategy,
    TupleAvailabilityByCount, builtin,
};
use rivulet_core::region::{RegionDefFormer, RegionExecutionPlan, StaticRegionExecutionPlanFactory};
use rivulet_core::types::Tuple;

pub const KEYS: i64 = 16;

pub type Sums = Arc<Mutex<HashMap<i64, i64>>>;

/// Forwards tuples from both inputs once each input has one for the key.
struct Joiner;

impl Operator for Joiner {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::on_all_ports(TupleAvailabilityByCount::AtLeast, 2, 1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        for port in 0..2 {
            for tuple in ctx.input.take(port) {
                ctx.emit(0, tuple);
            }
        }
        Ok(())
    }
}

struct Summer;

impl Operator for Summer {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::on_any_port(TupleAvailabilityByCount::AtLeast, 1, 1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        let input = ctx.input.take(0);
        let Some(key) = input.first().and_then(|t| t.get_int("key")) else {
            return Ok(());
        };
        let kv = ctx.kv()?;
        let sum = kv.get_int_or("sum", 0) + input.iter().filter_map(|t| t.get_int("value")).sum::<i64>();
        kv.set("sum", sum);
        ctx.emit(0, Tuple::new().with("key", key).with("sum", sum));
        Ok(())
    }
}

/// Keeps the largest value per key, both in its state and in `seen`.
struct Collector {
    seen: Sums,
}

impl Operator for Collector {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::on_any_port(TupleAvailabilityByCount::AtLeast, 1, 1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        let input = ctx.input.take(0);
        let kv = ctx.kv()?;
        let mut seen = self.seen.lock().unwrap();
        for tuple in input {
            let (Some(key), Some(value)) = (tuple.get_int("key"), tuple.get_int("value")) else {
                continue;
            };
            let field = format!("max_{}", key);
            let max = kv.get_int_or(&field, i64::MIN).max(value);
            kv.set(field, max);
            seen.insert(key, max);
        }
        Ok(())
    }
}

fn beacon(id: &str, step: i64, emitted: Sums) -> OperatorDef {
    let sequence = Arc::new(AtomicI64::new(0));
    builtin::beacon(id, 8, move |t| {
        let n = sequence.fetch_add(1, Ordering::SeqCst);
        let key = n % KEYS;
        let value = n % 5 + step;
        *emitted.lock().unwrap().entry(key).or_default() += value;
        t.set("key", key);
        t.set("value", value);
    })
}

pub struct JoinFlow {
    pub flow: Arc<FlowDef>,
    pub emitted: Sums,
    pub collected: Sums,
}

impl JoinFlow {
    pub fn new() -> Self {
        let emitted: Sums = Arc::default();
        let collected: Sums = Arc::default();
        let seen = Arc::clone(&collected);

        let mut builder = FlowDefBuilder::new();
        builder
            .add(beacon("beacon1", 1, Arc::clone(&emitted)))
            .unwrap()
            .add(beacon("beacon2", 10, Arc::clone(&emitted)))
            .unwrap()
            .add(
                OperatorDef::new("joiner", OperatorType::PartitionedStateful, || Box::new(Joiner))
                    .with_ports(2, 1)
                    .with_partition_fields(["key"]),
            )
            .unwrap()
            .add(
                OperatorDef::new("summer", OperatorType::PartitionedStateful, || Box::new(Summer))
                    .with_partition_fields(["key"]),
            )
            .unwrap()
            .add(
                builtin::mapper("multiplier", |t| {
                    Tuple::new()
                        .with("key", t.get_int("key").unwrap_or(0))
                        .with("value", t.get_int("sum").unwrap_or(0) * 100)
                })
                .with_input_fields(["key", "sum"]),
            )
            .unwrap()
            .add(OperatorDef::new("collector", OperatorType::Stateful, move || {
                Box::new(Collector {
                    seen: Arc::clone(&seen),
                })
            }))
            .unwrap()
            .connect_ports("beacon1", 0, "joiner", 0)
            .unwrap()
            .connect_ports("beacon2", 0, "joiner", 1)
            .unwrap()
            .connect("joiner", "summer")
            .unwrap()
            .connect("summer", "multiplier")
            .unwrap()
            .connect("multiplier", "collector")
            .unwrap();

        Self {
            flow: Arc::new(builder.build().unwrap()),
            emitted,
            collected,
        }
    }

    pub fn plans(&self, replica_count: usize, split_pipelines: bool) -> Vec<RegionExecutionPlan> {
        let regions = RegionDefFormer::new().create_regions(&self.flow).unwrap();
        StaticRegionExecutionPlanFactory::new(replica_count)
            .with_pipeline_split(split_pipelines)
            .create_region_execution_plans(regions)
            .unwrap()
    }

    pub fn assert_collected_matches_emitted(&self) {
        let emitted = self.emitted.lock().unwrap();
        let collected = self.collected.lock().unwrap();
        assert!(!emitted.is_empty());
        assert_eq!(collected.len(), emitted.len());
        for (key, sum) in emitted.iter() {
            assert_eq!(collected.get(key), Some(&(sum * 100)), "key {}", key);
        }
    }
}

pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.partition.partition_count = 16;
    config.partition.shuffle_seed = Some(42);
    config.manager.runner_command_timeout_ms = 5_000;
    config
}
