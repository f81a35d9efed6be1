//! Built-in operators.
//!
//! Each constructor function returns a ready [`OperatorDef`]; the closures are
//! shared between all replicas of the operator.

use std::sync::Arc;

use anyhow::Result;

use super::{
    InitContext, InvocationContext, Operator, OperatorDef, OperatorType, SchedulingStrategy,
    TupleAvailabilityByCount,
};
use crate::types::Tuple;

type Populator = Arc<dyn Fn(&mut Tuple) + Send + Sync>;
type MapFn = Arc<dyn Fn(&Tuple) -> Tuple + Send + Sync>;
type Predicate = Arc<dyn Fn(&Tuple) -> bool + Send + Sync>;
type Consumer = Arc<dyn Fn(&Tuple) + Send + Sync>;

/// Source emitting `tuple_count` tuples per invocation, each filled in by `populator`.
pub struct BeaconOperator {
    tuple_count: usize,
    populator: Populator,
}

pub fn beacon<F>(id: impl Into<String>, tuple_count: usize, populator: F) -> OperatorDef
where
    F: Fn(&mut Tuple) + Send + Sync + 'static,
{
    let populator: Populator = Arc::new(populator);
    OperatorDef::new(id, OperatorType::Stateless, move || {
        Box::new(BeaconOperator {
            tuple_count,
            populator: Arc::clone(&populator),
        })
    })
    .with_ports(0, 1)
}

impl Operator for BeaconOperator {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::WhenAvailable)
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        for _ in 0..self.tuple_count {
            let mut tuple = Tuple::new();
            (self.populator)(&mut tuple);
            ctx.emit(0, tuple);
        }
        Ok(())
    }
}

/// Transforms every input tuple into one output tuple.
pub struct MapperOperator {
    mapper: MapFn,
}

pub fn mapper<F>(id: impl Into<String>, mapper: F) -> OperatorDef
where
    F: Fn(&Tuple) -> Tuple + Send + Sync + 'static,
{
    let mapper: MapFn = Arc::new(mapper);
    OperatorDef::new(id, OperatorType::Stateless, move || {
        Box::new(MapperOperator {
            mapper: Arc::clone(&mapper),
        })
    })
}

impl Operator for MapperOperator {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::on_any_port(TupleAvailabilityByCount::AtLeast, 1, 1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        for tuple in ctx.input.take(0) {
            let mapped = (self.mapper)(&tuple);
            ctx.emit(0, mapped);
        }
        Ok(())
    }
}

/// Forwards the input tuples matching a predicate.
pub struct FilterOperator {
    predicate: Predicate,
}

pub fn filter<F>(id: impl Into<String>, predicate: F) -> OperatorDef
where
    F: Fn(&Tuple) -> bool + Send + Sync + 'static,
{
    let predicate: Predicate = Arc::new(predicate);
    OperatorDef::new(id, OperatorType::Stateless, move || {
        Box::new(FilterOperator {
            predicate: Arc::clone(&predicate),
        })
    })
}

impl Operator for FilterOperator {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::on_any_port(TupleAvailabilityByCount::AtLeast, 1, 1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        for tuple in ctx.input.take(0) {
            if (self.predicate)(&tuple) {
                ctx.emit(0, tuple);
            }
        }
        Ok(())
    }
}

/// Calls a consumer for every input tuple and forwards it unchanged.
pub struct ForEachOperator {
    consumer: Consumer,
}

pub fn for_each<F>(id: impl Into<String>, consumer: F) -> OperatorDef
where
    F: Fn(&Tuple) + Send + Sync + 'static,
{
    let consumer: Consumer = Arc::new(consumer);
    OperatorDef::new(id, OperatorType::Stateless, move || {
        Box::new(ForEachOperator {
            consumer: Arc::clone(&consumer),
        })
    })
}

impl Operator for ForEachOperator {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<SchedulingStrategy> {
        Ok(SchedulingStrategy::on_any_port(TupleAvailabilityByCount::AtLeast, 1, 1))
    }

    fn invoke(&mut self, ctx: &mut InvocationContext<'_>) -> Result<()> {
        for tuple in ctx.input.take(0) {
            (self.consumer)(&tuple);
            ctx.emit(0, tuple);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/builtin_tests.rs"]
mod tests;
