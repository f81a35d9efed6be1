//! Regions: runs of operators that share a statefulness class, their
//! execution plans, and the manager that materializes them into pipeline
//! replicas.

pub mod def;
pub mod former;
pub mod manager;
pub mod plan_factory;

pub use def::*;
pub use former::*;
pub use manager::*;
pub use plan_factory::*;

pub type RegionId = u32;
