//! Stage executions: triggers, dependency gating, pause, kill.

mod executor;
mod triggers;

pub use executor::StageExecutor;
pub use triggers::{delta_fire_time, worker_trigger_arguments};
