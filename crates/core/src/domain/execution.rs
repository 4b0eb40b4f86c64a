use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::state::{PlanState, RunState, StageState, StepState};

/// Outcome of a finished step. Empty until a reply was processed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepResult {
    #[default]
    #[serde(rename = "")]
    None,
    Ok,
    Fail,
}

impl StepResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Ok => "ok",
            Self::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "" => Some(Self::None),
            "ok" => Some(Self::Ok),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// Timestamps shared by every execution entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTimes {
    pub schedule_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub pause_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub state: RunState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub aps_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(plan_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id,
            state: RunState::default(),
            times: ExecutionTimes::default(),
            aps_job_id: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: Uuid,
    pub run_id: Uuid,
    pub plan_id: Uuid,
    pub worker_id: Uuid,
    pub state: PlanState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub aps_job_id: Option<String>,
    pub evidence_directory: Option<String>,
    /// Total time spent paused, in milliseconds. Delta triggers do not count it.
    pub paused_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl PlanExecution {
    pub fn new(run_id: Uuid, plan_id: Uuid, worker_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            plan_id,
            worker_id,
            state: PlanState::default(),
            times: ExecutionTimes::default(),
            aps_job_id: None,
            evidence_directory: None,
            paused_ms: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub stage_name: String,
    pub state: StageState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub aps_job_id: Option<String>,
    pub trigger_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StageExecution {
    pub fn new(plan_execution_id: Uuid, stage_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_execution_id,
            stage_name: stage_name.into(),
            state: StageState::default(),
            times: ExecutionTimes::default(),
            aps_job_id: None,
            trigger_id: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub stage_execution_id: Uuid,
    pub step_name: String,
    pub state: StepState,
    #[serde(flatten)]
    pub times: ExecutionTimes,
    pub result: StepResult,
    pub output: String,
    pub serialized_output: Value,
    /// Step execution whose completion caused this one to run.
    pub parent_id: Option<Uuid>,
    pub valid: bool,
    pub created_at: DateTime<Utc>,
}

impl StepExecution {
    pub fn new(stage_execution_id: Uuid, step_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage_execution_id,
            step_name: step_name.into(),
            state: StepState::default(),
            times: ExecutionTimes::default(),
            result: StepResult::None,
            output: String::new(),
            serialized_output: Value::Object(Default::default()),
            parent_id: None,
            valid: false,
            created_at: Utc::now(),
        }
    }

    /// Clears everything a previous execution wrote.
    pub fn reset(&mut self) {
        self.state = StepState::Pending;
        self.times = ExecutionTimes::default();
        self.result = StepResult::None;
        self.output.clear();
        self.serialized_output = Value::Object(Default::default());
        self.parent_id = None;
    }
}

/// Links an outstanding RPC to the step execution awaiting its reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrelationEvent {
    pub correlation_id: String,
    pub step_execution_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl CorrelationEvent {
    pub fn new(correlation_id: impl Into<String>, step_execution_id: Uuid) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            step_execution_id,
            created_at: Utc::now(),
        }
    }
}

/// Metasploit session opened by a step, reusable within one plan execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub name: Option<String>,
    pub worker_session_id: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        plan_execution_id: Uuid,
        name: Option<String>,
        worker_session_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_execution_id,
            name,
            worker_session_id: worker_session_id.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionVariable {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub name: String,
    pub value: Value,
}

impl ExecutionVariable {
    pub fn new(plan_execution_id: Uuid, name: impl Into<String>, value: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_execution_id,
            name: name.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_result_parsing() {
        assert_eq!(StepResult::parse("OK"), Some(StepResult::Ok));
        assert_eq!(StepResult::parse("fail"), Some(StepResult::Fail));
        assert_eq!(StepResult::parse(""), Some(StepResult::None));
        assert_eq!(StepResult::parse("maybe"), None);
        assert_eq!(serde_json::to_string(&StepResult::None).unwrap(), "\"\"");
    }

    #[test]
    fn test_step_execution_reset() {
        let mut step = StepExecution::new(Uuid::new_v4(), "scan");
        step.state = StepState::Finished;
        step.result = StepResult::Ok;
        step.output = "done".to_string();
        step.serialized_output = json!({"a": 1});
        step.parent_id = Some(Uuid::new_v4());
        step.times.start_time = Some(Utc::now());

        step.reset();

        assert_eq!(step.state, StepState::Pending);
        assert_eq!(step.result, StepResult::None);
        assert!(step.output.is_empty());
        assert_eq!(step.serialized_output, json!({}));
        assert!(step.parent_id.is_none());
        assert!(step.times.start_time.is_none());
    }
}
