//! Demo join flow run by the CLI.
//!
//! Two beacons emit `(key, value)` tuples into a partitioned join region
//! (`joiner -> summer -> multiplier`) whose output lands in a single
//! stateful `collector`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use rivulet_core::flow::{FlowDef, FlowDefBuilder};
use rivulet_core::operator::{
    InitContext, InvocationContext, Operator, OperatorDef, OperatorType, SchedulingStrategy,
    TupleAvailabilityByCount, builtin,
};
use rivulet_core::types::Tuple;

pub type Totals = Arc<Mutex<BTreeMap<i64, i64>>>;

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
        let added: i64 = input.iter().filter_map(|t| t.get_int("value")).sum();
        let kv = ctx.kv()?;
        let sum = kv.get_int_or("sum", 0) + added;
        kv.set("sum", sum);
        ctx.emit(0, Tuple::new().with("key", key).with("sum", sum));
        Ok(())
    }
}

struct Collector {
    totals: Totals,
}

impl Operator for Collector {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::on_any_port(TupleAvailabilityByCount::AtLeast, 1, 1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        let mut totals = self.totals.lock().expect("collector totals poisoned");
        for tuple in ctx.input.take(0) {
            if let (Some(key), Some(value)) = (tuple.get_int("key"), tuple.get_int("value")) {
                let total = totals.entry(key).or_insert(value);
                *total = (*total).max(value);
            }
        }
        Ok(())
    }
}

fn beacon(id: &str, step: i64, keys: i64, emitted: Totals) -> OperatorDef {
    let sequence = Arc::new(AtomicI64::new(0));
    builtin::beacon(id, 16, move |t| {
        let n = sequence.fetch_add(1, Ordering::Relaxed);
        let key = n % keys;
        let value = n % 5 + step;
        *emitted
            .lock()
            .expect("emitted totals poisoned")
            .entry(key)
            .or_default() += value;
        t.set("key", key);
        t.set("value", value);
    })
}

pub struct JoinFlow {
    pub flow: Arc<FlowDef>,
    /// Sum of emitted values per key.
    pub emitted: Totals,
    /// Largest collected value per key; 100 times the emitted sum once drained.
    pub collected: Totals,
}

pub fn join_flow(keys: i64) -> Result<JoinFlow> {
    let emitted: Totals = Arc::default();
    let collected: Totals = Arc::default();
    let totals = Arc::clone(&collected);

    let mut builder = FlowDefBuilder::new();
    builder
        .add(beacon("beacon1", 1, keys, Arc::clone(&emitted)))?
        .add(beacon("beacon2", 10, keys, Arc::clone(&emitted)))?
        .add(
            OperatorDef::new("joiner", OperatorType::PartitionedStateful, || Box::new(Joiner))
                .with_ports(2, 1)
                .with_partition_fields(["key"]),
        )?
        .add(
            OperatorDef::new("summer", OperatorType::PartitionedStateful, || Box::new(Summer))
                .with_partition_fields(["key"]),
        )?
        .add(
            builtin::mapper("multiplier", |t| {
                Tuple::new()
                    .with("key", t.get_int("key").unwrap_or_default())
                    .with("value", t.get_int("sum").unwrap_or_default() * 100)
            })
            .with_input_fields(["key", "sum"]),
        )?
        .add(OperatorDef::new("collector", OperatorType::Stateful, move || {
            Box::new(Collector {
                totals: Arc::clone(&totals),
            })
        }))?
        .connect_ports("beacon1", 0, "joiner", 0)?
        .connect_ports("beacon2", 0, "joiner", 1)?
        .connect("joiner", "summer")?
        .connect("summer", "multiplier")?
        .connect("multiplier", "collector")?;

    Ok(JoinFlow {
        flow: Arc::new(builder.build()?),
        emitted,
        collected,
    })
}
