//! Nested export of a run, mirroring Run → PlanExecution → StageExecution → StepExecution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::execution::{ExecutionTimes, StageExecution, StepExecution};
use super::state::{PlanState, RunState, StageState, StepState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub plan_name: String,
    pub state: RunState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub plan_executions: Vec<PlanExecutionReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecutionReport {
    pub id: Uuid,
    pub plan_name: String,
    pub worker_id: Uuid,
    pub worker_name: String,
    pub state: PlanState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub evidence_directory: Option<String>,
    pub stage_executions: Vec<StageExecutionReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecutionReport {
    pub id: Uuid,
    pub stage_name: String,
    pub state: StageState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub step_executions: Vec<StepExecutionReport>,
}

impl StageExecutionReport {
    pub fn new(stage: &StageExecution, step_executions: Vec<StepExecutionReport>) -> Self {
        Self {
            id: stage.id,
            stage_name: stage.stage_name.clone(),
            state: stage.state,
            times: stage.times.clone(),
            step_executions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionReport {
    pub id: Uuid,
    pub step_name: String,
    pub state: StepState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub result: String,
    pub output: String,
    pub serialized_output: Value,
    pub valid: bool,
}

impl From<&StepExecution> for StepExecutionReport {
    fn from(step: &StepExecution) -> Self {
        Self {
            id: step.id,
            step_name: step.step_name.clone(),
            state: step.state,
            times: step.times.clone(),
            result: step.result.as_str().to_string(),
            output: step.output.clone(),
            serialized_output: step.serialized_output.clone(),
            valid: step.valid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_step_report_flattens_times() {
        let mut step = StepExecution::new(Uuid::new_v4(), "scan");
        step.serialized_output = json!({"open": [22]});
        step.times.start_time = Some(Utc::now());

        let report = StepExecutionReport::from(&step);
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["step_name"], "scan");
        assert_eq!(value["state"], "PENDING");
        assert_eq!(value["result"], "");
        assert!(value["start_time"].is_string());
        assert!(value["finish_time"].is_null());
        assert_eq!(value["serialized_output"]["open"][0], 22);
    }
}
