mod correlation;
mod execution;
mod plan;
mod scheduler_job;
mod worker;

pub use correlation::{CorrelationEventRow, ExecutionVariableRow, SessionRow};
pub use execution::{PlanExecutionRow, RunRow, StageExecutionRow, StepExecutionRow};
pub(crate) use execution::times_to_columns;
pub use plan::PlanRow;
pub use scheduler_job::{SchedulerJob, SchedulerJobRow};
pub use worker::WorkerRow;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub(crate) fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn parse_id(id: &str) -> Uuid {
    Uuid::parse_str(id).unwrap_or_default()
}
