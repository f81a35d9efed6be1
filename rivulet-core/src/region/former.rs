//! Groups the operators of a flow into regions.
//!
//! 1. Walk the flow from its sources into operator sequences. A sequence
//!    continues while the current operator has exactly one downstream operator
//!    and that operator has exactly one upstream operator.
//! 2. A source operator always forms a sequence of its own.
//! 3. Cut every sequence into regions by operator type:
//!    - a stateful operator is a region by itself;
//!    - consecutive partitioned operators share a region while they partition
//!      by (a superset of) the same fields;
//!    - a stateless operator joins a preceding partitioned region when its
//!      input declares every partition field, and trailing stateless
//!      operators move into a following partitioned region on the same
//!      condition.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::flow::FlowDef;
use crate::operator::{OperatorDef, OperatorType};

use super::{RegionDef, RegionId, RegionType};

type OperatorSequence = Vec<Arc<OperatorDef>>;

#[derive(Debug, Default)]
pub struct RegionDefFormer {
    next_region_id: RegionId,
}

impl RegionDefFormer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_regions(&mut self, flow: &FlowDef) -> Result<Vec<RegionDef>> {
        let mut regions = Vec::new();
        for sequence in split_source_operators(operator_sequences(flow)) {
            regions.extend(self.regions_of_sequence(sequence)?);
        }
        Ok(regions)
    }

    fn regions_of_sequence(&mut self, sequence: OperatorSequence) -> Result<Vec<RegionDef>> {
        debug!(
            sequence = ?sequence.iter().map(|op| op.id.as_str()).collect::<Vec<_>>(),
            "forming regions"
        );
        let mut regions = Vec::new();
        let mut current: Option<(RegionType, Vec<String>)> = None;
        let mut operators: OperatorSequence = Vec::new();

        for operator in sequence {
            match operator.operator_type {
                OperatorType::Stateful => {
                    if let Some((region_type, fields)) = current.take() {
                        regions.push(self.region(region_type, fields, std::mem::take(&mut operators))?);
                    }
                    regions.push(self.region(RegionType::Stateful, Vec::new(), vec![operator])?);
                }
                OperatorType::Stateless => match &current {
                    None => {
                        current = Some((RegionType::Stateless, Vec::new()));
                        operators.push(operator);
                    }
                    Some((RegionType::Stateless, _)) => operators.push(operator),
                    Some((RegionType::PartitionedStateful, fields)) if declares_all(&operator, fields) => {
                        operators.push(operator)
                    }
                    Some(_) => {
                        if let Some((region_type, fields)) = current.take() {
                            regions.push(self.region(region_type, fields, std::mem::take(&mut operators))?);
                        }
                        current = Some((RegionType::Stateless, Vec::new()));
                        operators.push(operator);
                    }
                },
                OperatorType::PartitionedStateful => {
                    let partition_fields = operator.partition_field_names.clone();
                    match current.take() {
                        None => {
                            current = Some((RegionType::PartitionedStateful, partition_fields));
                            operators.push(operator);
                        }
                        Some((RegionType::PartitionedStateful, fields)) => {
                            if fields.iter().all(|f| partition_fields.contains(f)) {
                                current = Some((RegionType::PartitionedStateful, fields));
                            } else {
                                regions.push(self.region(
                                    RegionType::PartitionedStateful,
                                    fields,
                                    std::mem::take(&mut operators),
                                )?);
                                current = Some((RegionType::PartitionedStateful, partition_fields));
                            }
                            operators.push(operator);
                        }
                        Some(_) => {
                            // stateless run: its tail may move into the new region
                            let keep = operators
                                .iter()
                                .rposition(|op| !declares_all(op, &partition_fields))
                                .map_or(0, |i| i + 1);
                            let mut moved = operators.split_off(keep);
                            if !operators.is_empty() {
                                regions.push(self.region(
                                    RegionType::Stateless,
                                    Vec::new(),
                                    std::mem::take(&mut operators),
                                )?);
                            }
                            moved.push(operator);
                            operators = moved;
                            current = Some((RegionType::PartitionedStateful, partition_fields));
                        }
                    }
                }
            }
        }

        if let Some((region_type, fields)) = current {
            regions.push(self.region(region_type, fields, operators)?);
        }
        Ok(regions)
    }

    fn region(&mut self, region_type: RegionType, fields: Vec<String>, operators: OperatorSequence) -> Result<RegionDef> {
        let region_id = self.next_region_id;
        self.next_region_id += 1;
        RegionDef::new(region_id, region_type, fields, operators)
    }
}

fn declares_all(operator: &OperatorDef, fields: &[String]) -> bool {
    operator.operator_type == OperatorType::Stateless
        && operator.input_port_count == 1
        && operator.declares_input_fields(fields)
}

fn operator_sequences(flow: &FlowDef) -> Vec<OperatorSequence> {
    let mut sequences = Vec::new();
    let mut starts: BTreeSet<&str> = flow.sources().into_iter().map(|op| op.id.as_str()).collect();
    let mut processed: BTreeSet<&str> = BTreeSet::new();

    while let Some(start) = starts.pop_first() {
        processed.insert(start);
        let mut sequence = Vec::new();
        let mut current = start;
        loop {
            if let Some(operator) = flow.operator(current) {
                sequence.push(Arc::clone(operator));
            }
            let downstream = flow.downstream_operators(current);
            let single = (downstream.len() == 1)
                .then(|| downstream.first().copied())
                .flatten()
                .filter(|next| flow.upstream_operators(next).len() == 1);
            match single {
                Some(next) => current = next,
                None => {
                    starts.extend(downstream.into_iter().filter(|op| !processed.contains(op)));
                    break;
                }
            }
        }
        sequences.push(sequence);
    }
    sequences
}

fn split_source_operators(sequences: Vec<OperatorSequence>) -> Vec<OperatorSequence> {
    let mut split = Vec::with_capacity(sequences.len());
    for mut sequence in sequences {
        if sequence.len() > 1 && sequence[0].is_source() {
            let rest = sequence.split_off(1);
            split.push(sequence);
            split.push(rest);
        } else {
            split.push(sequence);
        }
    }
    split
}

#[cfg(test)]
#[path = "tests/former_tests.rs"]
mod tests;
