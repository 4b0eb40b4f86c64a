//! Per-type handling of step dispatch.

use bus::{HiveQueues, StepDispatch, WorkerQueues};
use cryton_core::{validate_step_arguments, StepTemplate, StepType};
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, Result};

/// Argument keys consumed by the hive and never sent to a worker.
pub const HIVE_ONLY_ARGUMENTS: [&str; 3] = [
    "use_named_session",
    "use_any_session_to_target",
    "create_named_session",
];

pub trait StepKind: Send + Sync {
    fn step_type(&self) -> StepType;

    fn validate(&self, template: &StepTemplate) -> Result<()> {
        validate_step_arguments(template)?;
        Ok(())
    }

    fn request_queue<'a>(&self, queues: &'a WorkerQueues) -> &'a str {
        &queues.attack
    }

    fn reply_queue<'a>(&self, queues: &'a HiveQueues) -> &'a str {
        &queues.attack_response
    }

    /// Builds the worker-facing body from resolved arguments.
    fn build_dispatch(
        &self,
        arguments: &Value,
        session_id: Option<&str>,
        queues: &HiveQueues,
    ) -> Result<StepDispatch>;
}

pub struct WorkerExecute;

impl StepKind for WorkerExecute {
    fn step_type(&self) -> StepType {
        StepType::WorkerExecute
    }

    fn build_dispatch(
        &self,
        arguments: &Value,
        session_id: Option<&str>,
        queues: &HiveQueues,
    ) -> Result<StepDispatch> {
        let module = arguments
            .get("module")
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestratorError::UnexpectedValue("'module' must be a string".to_string()))?;

        let mut module_arguments = match arguments.get("module_arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(OrchestratorError::UnexpectedValue(format!(
                    "'module_arguments' must be an object, got {other}"
                )))
            }
        };
        if let Some(session_id) = session_id {
            module_arguments.insert("session_id".to_string(), Value::String(session_id.to_string()));
        }

        let mut body = Map::new();
        body.insert("module".to_string(), Value::String(module.to_string()));
        body.insert("module_arguments".to_string(), Value::Object(module_arguments));
        Ok(dispatch(self, body, queues))
    }
}

pub struct EmpireExecute;

impl StepKind for EmpireExecute {
    fn step_type(&self) -> StepType {
        StepType::EmpireExecute
    }

    fn build_dispatch(
        &self,
        arguments: &Value,
        _session_id: Option<&str>,
        queues: &HiveQueues,
    ) -> Result<StepDispatch> {
        Ok(dispatch(self, worker_arguments(arguments)?, queues))
    }
}

pub struct EmpireDeployAgent;

impl StepKind for EmpireDeployAgent {
    fn step_type(&self) -> StepType {
        StepType::EmpireDeployAgent
    }

    fn request_queue<'a>(&self, queues: &'a WorkerQueues) -> &'a str {
        &queues.agent
    }

    fn reply_queue<'a>(&self, queues: &'a HiveQueues) -> &'a str {
        &queues.agent_response
    }

    fn build_dispatch(
        &self,
        arguments: &Value,
        session_id: Option<&str>,
        queues: &HiveQueues,
    ) -> Result<StepDispatch> {
        let mut body = worker_arguments(arguments)?;
        if let Some(session_id) = session_id {
            body.insert("session_id".to_string(), Value::String(session_id.to_string()));
        }
        Ok(dispatch(self, body, queues))
    }
}

pub fn kind_of(step_type: StepType) -> &'static dyn StepKind {
    match step_type {
        StepType::WorkerExecute => &WorkerExecute,
        StepType::EmpireExecute => &EmpireExecute,
        StepType::EmpireDeployAgent => &EmpireDeployAgent,
    }
}

fn worker_arguments(arguments: &Value) -> Result<Map<String, Value>> {
    let Some(map) = arguments.as_object() else {
        return Err(OrchestratorError::UnexpectedValue(
            "step arguments must be an object".to_string(),
        ));
    };
    Ok(map
        .iter()
        .filter(|(key, _)| !HIVE_ONLY_ARGUMENTS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect())
}

fn dispatch(kind: &dyn StepKind, arguments: Map<String, Value>, queues: &HiveQueues) -> StepDispatch {
    StepDispatch {
        step_type: kind.step_type().as_str().to_string(),
        arguments: Value::Object(arguments),
        ack_queue: kind.reply_queue(queues).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_execute_injects_session() {
        let args = json!({
            "module": "msf",
            "module_arguments": {"module_name": "scanner/ssh"},
            "use_named_session": "s1",
            "create_named_session": "s2"
        });
        let dispatch = kind_of(StepType::WorkerExecute)
            .build_dispatch(&args, Some("7"), &HiveQueues::default())
            .unwrap();
        assert_eq!(dispatch.step_type, "worker-execute");
        assert_eq!(dispatch.ack_queue, "cryton_hive.attack.response");
        assert_eq!(
            dispatch.arguments,
            json!({"module": "msf", "module_arguments": {"module_name": "scanner/ssh", "session_id": "7"}})
        );
    }

    #[test]
    fn test_queues_per_kind() {
        let worker = WorkerQueues::for_worker("alpha");
        let hive = HiveQueues::default();

        let execute = kind_of(StepType::EmpireExecute);
        assert_eq!(execute.request_queue(&worker), "cryton_worker.alpha.attack.request");
        assert_eq!(execute.reply_queue(&hive), "cryton_hive.attack.response");

        let deploy = kind_of(StepType::EmpireDeployAgent);
        assert_eq!(deploy.request_queue(&worker), "cryton_worker.alpha.agent.request");
        assert_eq!(deploy.reply_queue(&hive), "cryton_hive.agent.response");
    }

    #[test]
    fn test_empire_arguments_pass_through() {
        let args = json!({
            "use_agent": "agent-1",
            "shell_command": "whoami",
            "use_any_session_to_target": "10.0.0.1"
        });
        let dispatch = kind_of(StepType::EmpireExecute)
            .build_dispatch(&args, None, &HiveQueues::default())
            .unwrap();
        assert_eq!(dispatch.arguments, json!({"use_agent": "agent-1", "shell_command": "whoami"}));
        assert_eq!(dispatch.ack_queue, "cryton_hive.attack.response");
    }

    #[test]
    fn test_deploy_agent_carries_session() {
        let args = json!({
            "stager_arguments": {"listener_name": "l", "stager_type": "multi/bash", "agent_name": "a"},
            "use_named_session": "s1"
        });
        let dispatch = kind_of(StepType::EmpireDeployAgent)
            .build_dispatch(&args, Some("3"), &HiveQueues::default())
            .unwrap();
        assert_eq!(dispatch.arguments["session_id"], json!("3"));
        assert_eq!(dispatch.ack_queue, "cryton_hive.agent.response");

        let body = serde_json::to_value(&dispatch).unwrap();
        assert_eq!(body["ack_queue"], json!("cryton_hive.agent.response"));
        assert!(dispatch.arguments.get("use_named_session").is_none());
    }

    #[test]
    fn test_validate_uses_template_rules() {
        let template: StepTemplate = serde_json::from_value(json!({
            "name": "a",
            "step_type": "worker-execute",
            "arguments": {"module_arguments": {}}
        }))
        .unwrap();
        assert!(kind_of(StepType::WorkerExecute).validate(&template).is_err());
    }
}
