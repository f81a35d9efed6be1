use super::*;
use crate::operator::{OperatorDef, OperatorType, builtin};

fn region(region_id: u32, region_type: RegionType, operator_count: usize) -> RegionDef {
    let operators = (0..operator_count)
        .map(|i| {
            Arc::new(builtin::mapper(format!("op{}", i), |t| t.clone()).with_input_fields(["key"]))
        })
        .collect();
    let fields = match region_type {
        RegionType::PartitionedStateful => vec!["key".to_string()],
        _ => Vec::new(),
    };
    RegionDef::new(region_id, region_type, fields, operators).unwrap()
}

#[test]
fn test_replica_count_by_region_type() {
    let stateful = RegionDef::new(
        2,
        RegionType::Stateful,
        Vec::new(),
        vec![Arc::new(OperatorDef::new("s", OperatorType::Stateful, || {
            builtin::for_each("s", |_| {}).create_operator()
        }))],
    );
    let mut regions = vec![
        region(0, RegionType::Stateless, 1),
        region(1, RegionType::PartitionedStateful, 3),
    ];
    regions.extend(stateful);

    let plans = StaticRegionExecutionPlanFactory::new(4)
        .create_region_execution_plans(regions)
        .unwrap();
    let counts: Vec<usize> = plans.iter().map(RegionExecutionPlan::replica_count).collect();
    assert_eq!(counts, vec![1, 4, 1]);
    assert!(plans.iter().all(|plan| plan.pipeline_start_indices() == [0]));
}

#[test]
fn test_pipeline_split_cuts_at_middle_operator() {
    let factory = StaticRegionExecutionPlanFactory::new(2).with_pipeline_split(true);
    let plans = factory
        .create_region_execution_plans(vec![
            region(0, RegionType::Stateless, 1),
            region(1, RegionType::PartitionedStateful, 3),
        ])
        .unwrap();
    assert_eq!(plans[0].pipeline_start_indices(), &[0]);
    assert_eq!(plans[1].pipeline_start_indices(), &[0, 1]);
}
