pub mod adapter;
pub mod chase;
pub mod engine;
pub mod error;
pub mod sim;

pub use adapter::{BrokerAdapter, OrderSnapshot};
pub use chase::{chase_order, ChaseOutcome, ChaseRequest};
pub use engine::ExecutionEngine;
pub use error::ExecError;
pub use sim::SimBroker;
