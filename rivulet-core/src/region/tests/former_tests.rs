use super::*;
use crate::flow::FlowDefBuilder;
use crate::operator::{
    InitContext, InvocationContext, Operator, SchedulingStrategy, TupleAvailabilityByCount, builtin,
};

struct Noop;

impl Operator for Noop {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::on_any_port(
            TupleAvailabilityByCount::AtLeast,
            ctx.input_port_count,
            1,
        ))
    }

    fn invoke(&mut self, _ctx: &mut InvocationContext<'_>) -> Result<()> {
        Ok(())
    }
}

fn partitioned(id: &str, fields: &[&str]) -> OperatorDef {
    OperatorDef::new(id, OperatorType::PartitionedStateful, || Box::new(Noop))
        .with_partition_fields(fields.iter().copied())
}

fn stateless(id: &str) -> OperatorDef {
    builtin::mapper(id, |t| t.clone())
}

fn source(id: &str) -> OperatorDef {
    builtin::beacon(id, 1, |t| t.set("key", 1))
}

fn chain(operators: Vec<OperatorDef>) -> FlowDef {
    let ids: Vec<String> = operators.iter().map(|op| op.id.clone()).collect();
    let mut builder = FlowDefBuilder::new();
    for operator in operators {
        builder.add(operator).unwrap();
    }
    for pair in ids.windows(2) {
        builder.connect(&pair[0], &pair[1]).unwrap();
    }
    builder.build().unwrap()
}

fn shape(regions: &[RegionDef]) -> Vec<(RegionType, Vec<&str>)> {
    regions
        .iter()
        .map(|r| (r.region_type(), r.operators().iter().map(|op| op.id.as_str()).collect()))
        .collect()
}

#[test]
fn test_join_flow_regions() {
    let mut builder = FlowDefBuilder::new();
    builder
        .add(source("beacon1"))
        .unwrap()
        .add(source("beacon2"))
        .unwrap()
        .add(partitioned("joiner", &["key"]).with_ports(2, 1))
        .unwrap()
        .add(partitioned("summer", &["key"]))
        .unwrap()
        .add(stateless("multiplier").with_input_fields(["key", "sum"]))
        .unwrap()
        .add(OperatorDef::new("collector", OperatorType::Stateful, || Box::new(Noop)))
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
    let flow = builder.build().unwrap();

    let regions = RegionDefFormer::new().create_regions(&flow).unwrap();
    assert_eq!(
        shape(&regions),
        vec![
            (RegionType::Stateless, vec!["beacon1"]),
            (RegionType::Stateless, vec!["beacon2"]),
            (RegionType::PartitionedStateful, vec!["joiner", "summer", "multiplier"]),
            (RegionType::Stateful, vec!["collector"]),
        ]
    );
    let ids: Vec<RegionId> = regions.iter().map(RegionDef::region_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert_eq!(regions[2].partition_field_names(), &["key".to_string()]);
}

#[test]
fn test_declaring_stateless_tail_moves_into_partitioned_region() {
    let flow = chain(vec![
        source("src"),
        stateless("plain"),
        stateless("keyed").with_input_fields(["key"]),
        partitioned("counter", &["key"]),
    ]);
    let regions = RegionDefFormer::new().create_regions(&flow).unwrap();
    assert_eq!(
        shape(&regions),
        vec![
            (RegionType::Stateless, vec!["src"]),
            (RegionType::Stateless, vec!["plain"]),
            (RegionType::PartitionedStateful, vec!["keyed", "counter"]),
        ]
    );
}

#[test]
fn test_fully_declaring_stateless_run_has_no_region_of_its_own() {
    let flow = chain(vec![
        source("src"),
        stateless("keyed").with_input_fields(["key"]),
        partitioned("counter", &["key"]),
    ]);
    let regions = RegionDefFormer::new().create_regions(&flow).unwrap();
    assert_eq!(
        shape(&regions),
        vec![
            (RegionType::Stateless, vec!["src"]),
            (RegionType::PartitionedStateful, vec!["keyed", "counter"]),
        ]
    );
}

#[test]
fn test_partition_field_compatibility() {
    let superset = chain(vec![
        source("src"),
        partitioned("by_key", &["key"]),
        partitioned("by_key_and_day", &["key", "day"]),
    ]);
    let regions = RegionDefFormer::new().create_regions(&superset).unwrap();
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[1].operator_count(), 2);
    assert_eq!(regions[1].partition_field_names(), &["key".to_string()]);

    let disjoint = chain(vec![
        source("src"),
        partitioned("by_key", &["key"]),
        partitioned("by_day", &["day"]),
    ]);
    let regions = RegionDefFormer::new().create_regions(&disjoint).unwrap();
    assert_eq!(
        shape(&regions),
        vec![
            (RegionType::Stateless, vec!["src"]),
            (RegionType::PartitionedStateful, vec!["by_key"]),
            (RegionType::PartitionedStateful, vec!["by_day"]),
        ]
    );
}

#[test]
fn test_undeclared_stateless_after_partitioned_starts_new_region() {
    let flow = chain(vec![
        source("src"),
        partitioned("counter", &["key"]),
        stateless("plain"),
        stateless("after"),
    ]);
    let regions = RegionDefFormer::new().create_regions(&flow).unwrap();
    assert_eq!(
        shape(&regions),
        vec![
            (RegionType::Stateless, vec!["src"]),
            (RegionType::PartitionedStateful, vec!["counter"]),
            (RegionType::Stateless, vec!["plain", "after"]),
        ]
    );
}

#[test]
fn test_fan_out_starts_new_sequences() {
    let mut builder = FlowDefBuilder::new();
    builder
        .add(source("src"))
        .unwrap()
        .add(stateless("left"))
        .unwrap()
        .add(stateless("right"))
        .unwrap()
        .connect("src", "left")
        .unwrap()
        .connect("src", "right")
        .unwrap();
    let flow = builder.build().unwrap();

    let regions = RegionDefFormer::new().create_regions(&flow).unwrap();
    assert_eq!(
        shape(&regions),
        vec![
            (RegionType::Stateless, vec!["src"]),
            (RegionType::Stateless, vec!["left"]),
            (RegionType::Stateless, vec!["right"]),
        ]
    );
}
