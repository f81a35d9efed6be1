//! Pipelines: operator replica chains, the runners that drive them, the
//! senders between them, and the manager that reconfigures them.

pub mod ids;
pub mod instance;
pub mod manager;
pub mod operator_replica;
pub mod replica;
pub mod runner;
pub mod sender;
pub mod supervisor;
pub mod upstream;

pub use ids::*;
pub use instance::*;
pub use manager::*;
pub use operator_replica::*;
pub use replica::*;
pub use runner::*;
pub use sender::*;
pub use supervisor::*;
pub use upstream::*;
