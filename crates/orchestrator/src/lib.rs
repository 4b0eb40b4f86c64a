pub mod config;
pub mod context;
pub mod creator;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod hive;
pub mod listener;
pub mod plan;
pub mod progress;
pub mod report;
pub mod resolver;
pub mod run;
pub mod scheduler;
pub mod stage;
pub mod state_machine;
pub mod step;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use context::HiveContext;
pub use creator::Creator;
pub use error::{OrchestratorError, Result};
pub use event::EventRouter;
pub use hive::Hive;
pub use plan::{ModuleValidation, PlanExecutor};
pub use progress::Progress;
pub use report::export as export_report;
pub use run::RunCoordinator;
pub use stage::StageExecutor;
pub use step::{DispatchOutcome, StepExecutor};
pub use worker::{WorkerClient, WorkerService};
