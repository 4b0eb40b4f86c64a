//! Step executions: dispatch to workers, reply handling, successor edges.

mod executor;
pub mod kind;
pub mod output_mapping;
pub mod session;
pub mod successors;

pub use executor::{DispatchOutcome, StepExecutor};
pub use kind::{kind_of, StepKind};
