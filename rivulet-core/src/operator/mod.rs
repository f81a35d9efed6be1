//! Operator authoring API: the [`Operator`] trait, its definition record, the
//! scheduling strategies it declares, and a few built-in operators.

pub mod builtin;
pub mod context;
pub mod def;
pub mod strategy;

pub use builtin::*;
pub use context::*;
pub use def::*;
pub use strategy::*;
