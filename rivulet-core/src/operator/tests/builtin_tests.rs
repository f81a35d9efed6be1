use super::*;
use crate::operator::{InvocationReason, KvStore};
use crate::pipeline::UpstreamContext;
use crate::types::Tuples;

fn invoke(operator: &mut dyn Operator, input: Tuples) -> Tuples {
    let mut output = Tuples::new(1);
    let mut ctx = InvocationContext {
        reason: InvocationReason::Success,
        input,
        output: &mut output,
        partition_key: None,
        kv: None,
    };
    operator.invoke(&mut ctx).unwrap();
    output
}

fn init(def: &OperatorDef, operator: &mut dyn Operator) -> SchedulingStrategy {
    let upstream = UpstreamContext::initial(def.input_port_count);
    let ctx = InitContext {
        operator_id: &def.id,
        replica_index: 0,
        input_port_count: def.input_port_count,
        output_port_count: def.output_port_count,
        partition_field_names: &def.partition_field_names,
        upstream_context: &upstream,
    };
    operator.init(&ctx).unwrap()
}

#[test]
fn test_beacon_emits_configured_count() {
    let def = beacon("src", 3, |t| t.set("v", 1));
    assert!(def.is_source());
    let mut operator = def.create_operator();
    assert_eq!(init(&def, operator.as_mut()), SchedulingStrategy::WhenAvailable);

    let output = invoke(operator.as_mut(), Tuples::new(0));
    assert_eq!(output.tuple_count(0), 3);
    assert_eq!(output.get(0)[0].get_int("v"), Some(1));
}

#[test]
fn test_mapper_and_filter() {
    let def = mapper("double", |t| Tuple::new().with("v", t.get_int("v").unwrap_or(0) * 2));
    let mut operator = def.create_operator();
    let mut input = Tuples::new(1);
    input.add(0, Tuple::new().with("v", 4));
    let output = invoke(operator.as_mut(), input);
    assert_eq!(output.get(0)[0].get_int("v"), Some(8));

    let def = filter("even", |t| t.get_int("v").unwrap_or(1) % 2 == 0);
    let mut operator = def.create_operator();
    let mut input = Tuples::new(1);
    input.add_all(0, (0..5).map(|v| Tuple::new().with("v", v)));
    let output = invoke(operator.as_mut(), input);
    assert_eq!(output.tuple_count(0), 3);
}

#[test]
fn test_for_each_forwards_and_observes() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let def = for_each("peek", move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    let mut operator = def.create_operator();
    let mut input = Tuples::new(1);
    input.add_all(0, (0..4).map(|v| Tuple::new().with("v", v)));
    let output = invoke(operator.as_mut(), input);
    assert_eq!(output.tuple_count(0), 4);
    assert_eq!(seen.load(Ordering::Relaxed), 4);
}

#[test]
fn test_kv_missing_for_stateless_invocation() {
    let mut output = Tuples::new(1);
    let mut ctx = InvocationContext {
        reason: InvocationReason::Success,
        input: Tuples::new(1),
        output: &mut output,
        partition_key: None,
        kv: None,
    };
    assert!(ctx.kv().is_err());

    let mut store = KvStore::new();
    let mut ctx = InvocationContext {
        reason: InvocationReason::Success,
        input: Tuples::new(1),
        output: &mut output,
        partition_key: None,
        kv: Some(&mut store),
    };
    ctx.kv().unwrap().set("sum", 5);
    assert_eq!(store.get_int_or("sum", 0), 5);
}
