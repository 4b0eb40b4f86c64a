use cryton_core::{
    ExecutionTimes, PlanExecution, PlanState, Run, RunState, StageExecution, StageState,
    StepExecution, StepResult, StepState,
};
use serde_json::Value;

use super::{datetime_to_millis, millis_to_datetime, parse_id};

fn times_from_columns(
    schedule_time: Option<i64>,
    start_time: Option<i64>,
    pause_time: Option<i64>,
    finish_time: Option<i64>,
) -> ExecutionTimes {
    ExecutionTimes {
        schedule_time: schedule_time.map(millis_to_datetime),
        start_time: start_time.map(millis_to_datetime),
        pause_time: pause_time.map(millis_to_datetime),
        finish_time: finish_time.map(millis_to_datetime),
    }
}

/// Column values of [`ExecutionTimes`], in table order.
pub(crate) fn times_to_columns(
    times: &ExecutionTimes,
) -> (Option<i64>, Option<i64>, Option<i64>, Option<i64>) {
    (
        times.schedule_time.map(datetime_to_millis),
        times.start_time.map(datetime_to_millis),
        times.pause_time.map(datetime_to_millis),
        times.finish_time.map(datetime_to_millis),
    )
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRow {
    pub id: String,
    pub plan_id: String,
    pub state: String,
    pub schedule_time: Option<i64>,
    pub start_time: Option<i64>,
    pub pause_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub aps_job_id: Option<String>,
    pub created_at: i64,
}

impl RunRow {
    pub fn into_domain(self) -> Run {
        Run {
            id: parse_id(&self.id),
            plan_id: parse_id(&self.plan_id),
            state: RunState::parse(&self.state).unwrap_or_default(),
            times: times_from_columns(
                self.schedule_time,
                self.start_time,
                self.pause_time,
                self.finish_time,
            ),
            aps_job_id: self.aps_job_id,
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanExecutionRow {
    pub id: String,
    pub run_id: String,
    pub plan_id: String,
    pub worker_id: String,
    pub state: String,
    pub schedule_time: Option<i64>,
    pub start_time: Option<i64>,
    pub pause_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub aps_job_id: Option<String>,
    pub evidence_directory: Option<String>,
    pub paused_ms: i64,
    pub created_at: i64,
}

impl PlanExecutionRow {
    pub fn into_domain(self) -> PlanExecution {
        PlanExecution {
            id: parse_id(&self.id),
            run_id: parse_id(&self.run_id),
            plan_id: parse_id(&self.plan_id),
            worker_id: parse_id(&self.worker_id),
            state: PlanState::parse(&self.state).unwrap_or_default(),
            times: times_from_columns(
                self.schedule_time,
                self.start_time,
                self.pause_time,
                self.finish_time,
            ),
            aps_job_id: self.aps_job_id,
            evidence_directory: self.evidence_directory,
            paused_ms: self.paused_ms,
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StageExecutionRow {
    pub id: String,
    pub plan_execution_id: String,
    pub stage_name: String,
    pub state: String,
    pub schedule_time: Option<i64>,
    pub start_time: Option<i64>,
    pub pause_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub aps_job_id: Option<String>,
    pub trigger_id: Option<String>,
    pub created_at: i64,
}

impl StageExecutionRow {
    pub fn into_domain(self) -> StageExecution {
        StageExecution {
            id: parse_id(&self.id),
            plan_execution_id: parse_id(&self.plan_execution_id),
            stage_name: self.stage_name,
            state: StageState::parse(&self.state).unwrap_or_default(),
            times: times_from_columns(
                self.schedule_time,
                self.start_time,
                self.pause_time,
                self.finish_time,
            ),
            aps_job_id: self.aps_job_id,
            trigger_id: self.trigger_id,
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepExecutionRow {
    pub id: String,
    pub stage_execution_id: String,
    pub step_name: String,
    pub state: String,
    pub schedule_time: Option<i64>,
    pub start_time: Option<i64>,
    pub pause_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub result: String,
    pub output: String,
    pub serialized_output: String,
    pub parent_id: Option<String>,
    pub valid: bool,
    pub created_at: i64,
}

impl StepExecutionRow {
    pub fn into_domain(self) -> StepExecution {
        StepExecution {
            id: parse_id(&self.id),
            stage_execution_id: parse_id(&self.stage_execution_id),
            step_name: self.step_name,
            state: StepState::parse(&self.state).unwrap_or_default(),
            times: times_from_columns(
                self.schedule_time,
                self.start_time,
                self.pause_time,
                self.finish_time,
            ),
            result: StepResult::parse(&self.result).unwrap_or_default(),
            output: self.output,
            serialized_output: serde_json::from_str(&self.serialized_output)
                .unwrap_or_else(|_| Value::Object(Default::default())),
            parent_id: self.parent_id.as_deref().map(parse_id),
            valid: self.valid,
            created_at: millis_to_datetime(self.created_at),
        }
    }
}
