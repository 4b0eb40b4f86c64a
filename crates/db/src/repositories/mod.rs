mod correlation_repository;
mod plan_execution_repository;
mod plan_repository;
mod run_repository;
mod scheduler_job_repository;
mod session_repository;
mod stage_execution_repository;
mod step_execution_repository;
mod variable_repository;
mod worker_repository;

pub use correlation_repository::CorrelationRepository;
pub use plan_execution_repository::PlanExecutionRepository;
pub use plan_repository::PlanRepository;
pub use run_repository::RunRepository;
pub use scheduler_job_repository::SchedulerJobRepository;
pub use session_repository::SessionRepository;
pub use stage_execution_repository::StageExecutionRepository;
pub use step_execution_repository::StepExecutionRepository;
pub use variable_repository::ExecutionVariableRepository;
pub use worker_repository::WorkerRepository;
