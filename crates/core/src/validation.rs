//! Plan document parsing and structural validation.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::domain::{PlanTemplate, StageTemplate, StepTemplate, StepType, SuccessorType, TriggerSpec, TriggerType};
use crate::error::ValidationError;
use crate::keypath::KeyPath;

/// Prefix reserved for the parent step in dynamic references.
pub const PARENT_PREFIX: &str = "parent";

/// Parses and validates a plan document. The document may be wrapped in a top-level `plan` key.
pub fn parse_plan_document(document: &Value) -> Result<PlanTemplate, ValidationError> {
    let plan = document.get("plan").unwrap_or(document);
    check_variant_names(plan)?;

    let template: PlanTemplate = serde_json::from_value(plan.clone())
        .map_err(|e| ValidationError::InvalidDocument(e.to_string()))?;
    validate_plan(&template)?;

    Ok(template)
}

/// Reports unknown trigger/step/successor types with their dedicated errors before serde sees them.
fn check_variant_names(plan: &Value) -> Result<(), ValidationError> {
    let stages = plan.get("stages").and_then(Value::as_array);
    for stage in stages.into_iter().flatten() {
        if let Some(name) = stage.get("trigger_type").and_then(Value::as_str) {
            if TriggerType::parse(name).is_none() {
                return Err(ValidationError::TriggerTypeDoesNotExist(name.to_string()));
            }
        }

        let steps = stage.get("steps").and_then(Value::as_array);
        for step in steps.into_iter().flatten() {
            if let Some(name) = step.get("step_type").and_then(Value::as_str) {
                if StepType::parse(name).is_none() {
                    return Err(ValidationError::StepTypeDoesNotExist(name.to_string()));
                }
            }

            let successors = step.get("next").and_then(Value::as_array);
            for successor in successors.into_iter().flatten() {
                if let Some(name) = successor.get("type").and_then(Value::as_str) {
                    if SuccessorType::parse(name).is_none() {
                        return Err(ValidationError::SuccessorTypeDoesNotExist(name.to_string()));
                    }
                }
            }
        }
    }
    Ok(())
}

pub fn validate_plan(plan: &PlanTemplate) -> Result<(), ValidationError> {
    if plan.name.trim().is_empty() {
        return Err(ValidationError::EmptyPlanName);
    }

    let mut stage_names = HashSet::new();
    for stage in &plan.stages {
        if !stage_names.insert(stage.name.as_str()) {
            return Err(ValidationError::DuplicateStage(stage.name.clone()));
        }
    }

    for stage in &plan.stages {
        TriggerSpec::parse(&stage.name, stage.trigger_type, &stage.trigger_args)?;
        for dependency in &stage.depends_on {
            if dependency == &stage.name || !stage_names.contains(dependency.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    stage: stage.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }
    check_dependency_cycles(plan)?;

    let mut prefixes = HashSet::new();
    for step in plan.stages.iter().flat_map(|s| s.steps.iter()) {
        let prefix = step.output_prefix();
        if prefix == PARENT_PREFIX {
            return Err(ValidationError::ReservedOutputPrefix(prefix.to_string()));
        }
        if !prefixes.insert(prefix) {
            return Err(ValidationError::DuplicateOutputPrefix(prefix.to_string()));
        }
    }

    for stage in &plan.stages {
        validate_stage(stage, plan.dynamic)?;
    }

    Ok(())
}

fn check_dependency_cycles(plan: &PlanTemplate) -> Result<(), ValidationError> {
    let edges: HashMap<&str, Vec<&str>> = plan
        .stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.iter().map(String::as_str).collect()))
        .collect();

    let mut colors: HashMap<&str, Color> = HashMap::new();
    for stage in &plan.stages {
        if let Some(node) = find_cycle(stage.name.as_str(), &edges, &mut colors) {
            return Err(ValidationError::DependencyCycle(node.to_string()));
        }
    }
    Ok(())
}

pub fn validate_stage(stage: &StageTemplate, dynamic: bool) -> Result<(), ValidationError> {
    let mut names = HashSet::new();
    for step in &stage.steps {
        if !names.insert(step.name.as_str()) {
            return Err(ValidationError::DuplicateStep {
                stage: stage.name.clone(),
                step: step.name.clone(),
            });
        }
    }

    for step in &stage.steps {
        validate_step_arguments(step)?;
        for successor in &step.next {
            validate_successor_value(step, successor.successor_type, &successor.value)?;
            for target in &successor.step {
                if !names.contains(target.as_str()) {
                    return Err(ValidationError::UnknownSuccessor {
                        stage: stage.name.clone(),
                        step: step.name.clone(),
                        successor: target.clone(),
                    });
                }
            }
        }
    }

    let init: Vec<&str> = stage.init_steps().map(|s| s.name.as_str()).collect();
    if init.is_empty() && !dynamic {
        return Err(ValidationError::MissingInitStep(stage.name.clone()));
    }

    let successors: HashSet<&str> = stage
        .steps
        .iter()
        .flat_map(|s| s.successor_names())
        .collect();
    if let Some(step) = init.iter().find(|name| successors.contains(*name)) {
        return Err(ValidationError::InitStepIsSuccessor {
            stage: stage.name.clone(),
            step: step.to_string(),
        });
    }

    let edges: HashMap<&str, Vec<&str>> = stage
        .steps
        .iter()
        .map(|s| (s.name.as_str(), s.successor_names()))
        .collect();
    let mut colors: HashMap<&str, Color> = HashMap::new();
    for step in &stage.steps {
        if let Some(node) = find_cycle(step.name.as_str(), &edges, &mut colors) {
            return Err(ValidationError::CycleDetected {
                stage: stage.name.clone(),
                step: node.to_string(),
            });
        }
    }

    if !init.is_empty() {
        let mut reached: HashSet<&str> = HashSet::new();
        let mut frontier = init.clone();
        while let Some(name) = frontier.pop() {
            if reached.insert(name) {
                frontier.extend(edges.get(name).into_iter().flatten().copied());
            }
        }
        if let Some(step) = stage.steps.iter().find(|s| !reached.contains(s.name.as_str())) {
            return Err(ValidationError::UnreachableStep {
                stage: stage.name.clone(),
                step: step.name.clone(),
            });
        }
    }

    Ok(())
}

fn validate_successor_value(
    step: &StepTemplate,
    successor_type: SuccessorType,
    value: &Value,
) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidSuccessor {
        step: step.name.clone(),
        reason,
    };

    match successor_type {
        SuccessorType::Result => match value.as_str().map(str::to_lowercase).as_deref() {
            Some("ok") | Some("fail") => Ok(()),
            _ => Err(invalid(format!("result value must be 'ok' or 'fail', got {}", value))),
        },
        SuccessorType::Output => match value {
            Value::String(_) => Ok(()),
            _ => Err(invalid("output value must be a string".to_string())),
        },
        SuccessorType::SerializedOutput => {
            let key = value
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("serialized_output value needs a 'key' path".to_string()))?;
            KeyPath::parse(key)?;
            if value.get("value").is_none() {
                return Err(invalid("serialized_output value needs an expected 'value'".to_string()));
            }
            Ok(())
        }
        SuccessorType::Any => Ok(()),
    }
}

/// Checks the argument shape required by each step type.
pub fn validate_step_arguments(step: &StepTemplate) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidStepArguments {
        step: step.name.clone(),
        reason: reason.to_string(),
    };

    let Some(arguments) = step.arguments.as_object() else {
        return Err(invalid("arguments must be an object"));
    };
    let optional_str = |key: &str| match arguments.get(key) {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err(invalid(&format!("'{}' must be a string", key))),
    };
    let required_str = |key: &str| match arguments.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(()),
        _ => Err(invalid(&format!("'{}' is required", key))),
    };

    optional_str("use_named_session")?;
    optional_str("use_any_session_to_target")?;
    if arguments.contains_key("use_named_session") && arguments.contains_key("use_any_session_to_target") {
        return Err(invalid(
            "'use_named_session' and 'use_any_session_to_target' are mutually exclusive",
        ));
    }

    match step.step_type {
        StepType::WorkerExecute => {
            required_str("module")?;
            optional_str("create_named_session")?;
            match arguments.get("module_arguments") {
                None | Some(Value::Object(_)) => Ok(()),
                Some(_) => Err(invalid("'module_arguments' must be an object")),
            }
        }
        StepType::EmpireExecute => {
            required_str("use_agent")?;
            let shell = arguments.contains_key("shell_command");
            let module = arguments.contains_key("empire_module");
            match (shell, module) {
                (true, false) => required_str("shell_command"),
                (false, true) => {
                    required_str("empire_module")?;
                    match arguments.get("empire_module_arguments") {
                        None | Some(Value::Object(_)) => Ok(()),
                        Some(_) => Err(invalid("'empire_module_arguments' must be an object")),
                    }
                }
                _ => Err(invalid(
                    "exactly one of 'shell_command' or 'empire_module' is required",
                )),
            }
        }
        StepType::EmpireDeployAgent => {
            let Some(stager) = arguments.get("stager_arguments").and_then(Value::as_object) else {
                return Err(invalid("'stager_arguments' object is required"));
            };
            for key in ["listener_name", "stager_type", "agent_name"] {
                if !matches!(stager.get(key), Some(Value::String(s)) if !s.is_empty()) {
                    return Err(invalid(&format!("'stager_arguments.{}' is required", key)));
                }
            }
            Ok(())
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Visiting,
    Done,
}

/// Depth-first search; returns a node on a cycle reachable from `start`, if any.
fn find_cycle<'a>(
    start: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    colors: &mut HashMap<&'a str, Color>,
) -> Option<&'a str> {
    match colors.get(start) {
        Some(Color::Done) => return None,
        Some(Color::Visiting) => return Some(start),
        None => {}
    }

    colors.insert(start, Color::Visiting);
    for &next in edges.get(start).into_iter().flatten() {
        if let Some(node) = find_cycle(next, edges, colors) {
            return Some(node);
        }
    }
    colors.insert(start, Color::Done);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cmd_step(name: &str, is_init: bool, next: Value) -> Value {
        json!({
            "name": name,
            "step_type": "worker-execute",
            "is_init": is_init,
            "arguments": {"module": "mod_cmd", "module_arguments": {"cmd": "echo hi"}},
            "next": next
        })
    }

    fn plan_with_steps(steps: Vec<Value>) -> Value {
        json!({
            "plan": {
                "name": "test",
                "stages": [{
                    "name": "s1",
                    "trigger_type": "delta",
                    "trigger_args": {"seconds": 0},
                    "steps": steps
                }]
            }
        })
    }

    #[test]
    fn test_valid_plan() {
        let doc = plan_with_steps(vec![
            cmd_step("a", true, json!([
                {"type": "result", "value": "OK", "step": "b"},
                {"type": "result", "value": "fail", "step": "c"}
            ])),
            cmd_step("b", false, json!([])),
            cmd_step("c", false, json!([])),
        ]);
        let plan = parse_plan_document(&doc).unwrap();
        assert_eq!(plan.stages[0].steps.len(), 3);
    }

    #[test]
    fn test_unknown_trigger_type() {
        let doc = json!({"name": "p", "stages": [
            {"name": "s", "trigger_type": "cron", "steps": []}
        ]});
        assert_eq!(
            parse_plan_document(&doc).unwrap_err(),
            ValidationError::TriggerTypeDoesNotExist("cron".to_string())
        );
    }

    #[test]
    fn test_unknown_step_type() {
        let doc = plan_with_steps(vec![json!({"name": "a", "step_type": "ssh", "is_init": true})]);
        assert_eq!(
            parse_plan_document(&doc).unwrap_err(),
            ValidationError::StepTypeDoesNotExist("ssh".to_string())
        );
    }

    #[test]
    fn test_missing_init_step() {
        let doc = plan_with_steps(vec![cmd_step("a", false, json!([]))]);
        assert!(matches!(
            parse_plan_document(&doc),
            Err(ValidationError::MissingInitStep(_))
        ));
    }

    #[test]
    fn test_dynamic_plan_allows_empty_stage() {
        let doc = json!({"name": "p", "dynamic": true, "stages": [
            {"name": "s", "trigger_type": "delta", "trigger_args": {}, "steps": []}
        ]});
        assert!(parse_plan_document(&doc).is_ok());
    }

    #[test]
    fn test_cycle_detected() {
        let doc = plan_with_steps(vec![
            cmd_step("a", true, json!([{"type": "any", "step": "b"}])),
            cmd_step("b", false, json!([{"type": "any", "step": "c"}])),
            cmd_step("c", false, json!([{"type": "any", "step": "b"}])),
        ]);
        assert!(matches!(
            parse_plan_document(&doc),
            Err(ValidationError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_init_step_cannot_be_successor() {
        let doc = plan_with_steps(vec![
            cmd_step("a", true, json!([{"type": "any", "step": "b"}])),
            cmd_step("b", true, json!([])),
        ]);
        assert!(matches!(
            parse_plan_document(&doc),
            Err(ValidationError::InitStepIsSuccessor { .. })
        ));
    }

    #[test]
    fn test_unreachable_step() {
        let doc = plan_with_steps(vec![
            cmd_step("a", true, json!([])),
            cmd_step("orphan", false, json!([])),
        ]);
        assert!(matches!(
            parse_plan_document(&doc),
            Err(ValidationError::UnreachableStep { .. })
        ));
    }

    #[test]
    fn test_unknown_successor() {
        let doc = plan_with_steps(vec![cmd_step("a", true, json!([{"type": "any", "step": "zzz"}]))]);
        assert!(matches!(
            parse_plan_document(&doc),
            Err(ValidationError::UnknownSuccessor { .. })
        ));
    }

    #[test]
    fn test_invalid_result_successor_value() {
        let doc = plan_with_steps(vec![
            cmd_step("a", true, json!([{"type": "result", "value": "maybe", "step": "b"}])),
            cmd_step("b", false, json!([])),
        ]);
        assert!(matches!(
            parse_plan_document(&doc),
            Err(ValidationError::InvalidSuccessor { .. })
        ));
    }

    #[test]
    fn test_serialized_output_successor_requires_key() {
        let doc = plan_with_steps(vec![
            cmd_step("a", true, json!([{"type": "serialized_output", "value": {"value": 1}, "step": "b"}])),
            cmd_step("b", false, json!([])),
        ]);
        assert!(parse_plan_document(&doc).is_err());

        let doc = plan_with_steps(vec![
            cmd_step("a", true, json!([{"type": "serialized_output", "value": {"key": "x[0]", "value": 1}, "step": "b"}])),
            cmd_step("b", false, json!([])),
        ]);
        assert!(parse_plan_document(&doc).is_ok());
    }

    #[test]
    fn test_dependency_validation() {
        let doc = json!({"name": "p", "stages": [
            {"name": "s1", "trigger_type": "delta", "trigger_args": {}, "depends_on": ["s2"],
             "steps": [cmd_step("a", true, json!([]))]},
            {"name": "s2", "trigger_type": "delta", "trigger_args": {}, "depends_on": ["s1"],
             "steps": [cmd_step("b", true, json!([]))]}
        ]});
        assert!(matches!(
            parse_plan_document(&doc),
            Err(ValidationError::DependencyCycle(_))
        ));

        let doc = json!({"name": "p", "stages": [
            {"name": "s1", "trigger_type": "delta", "trigger_args": {}, "depends_on": ["nope"],
             "steps": [cmd_step("a", true, json!([]))]}
        ]});
        assert!(matches!(
            parse_plan_document(&doc),
            Err(ValidationError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_output_prefix() {
        let doc = json!({"name": "p", "stages": [
            {"name": "s1", "trigger_type": "delta", "trigger_args": {}, "steps": [cmd_step("a", true, json!([]))]},
            {"name": "s2", "trigger_type": "delta", "trigger_args": {}, "steps": [cmd_step("a", true, json!([]))]}
        ]});
        assert_eq!(
            parse_plan_document(&doc).unwrap_err(),
            ValidationError::DuplicateOutputPrefix("a".to_string())
        );
    }

    #[test]
    fn test_parent_prefix_is_reserved() {
        let mut step = cmd_step("a", true, json!([]));
        step["output_prefix"] = json!("parent");
        let doc = plan_with_steps(vec![step]);
        assert!(matches!(
            parse_plan_document(&doc),
            Err(ValidationError::ReservedOutputPrefix(_))
        ));
    }

    #[test]
    fn test_step_argument_validation() {
        let doc = plan_with_steps(vec![json!({
            "name": "a", "step_type": "worker-execute", "is_init": true, "arguments": {}
        })]);
        assert!(matches!(
            parse_plan_document(&doc),
            Err(ValidationError::InvalidStepArguments { .. })
        ));

        let doc = plan_with_steps(vec![json!({
            "name": "a", "step_type": "empire-execute", "is_init": true,
            "arguments": {"use_agent": "agent1", "shell_command": "whoami"}
        })]);
        assert!(parse_plan_document(&doc).is_ok());

        let doc = plan_with_steps(vec![json!({
            "name": "a", "step_type": "empire-execute", "is_init": true,
            "arguments": {"use_agent": "agent1", "shell_command": "whoami", "empire_module": "x"}
        })]);
        assert!(parse_plan_document(&doc).is_err());

        let doc = plan_with_steps(vec![json!({
            "name": "a", "step_type": "empire-deploy-agent", "is_init": true,
            "arguments": {"stager_arguments": {"listener_name": "l", "stager_type": "multi/bash", "agent_name": "agent1"}}
        })]);
        assert!(parse_plan_document(&doc).is_ok());
    }

    /// Every accepted stage is acyclic and fully reachable from its init set.
    #[test]
    fn test_accepted_plans_are_dags() {
        let doc = plan_with_steps(vec![
            cmd_step("a", true, json!([{"type": "any", "step": ["b", "c"]}])),
            cmd_step("b", false, json!([{"type": "any", "step": "d"}])),
            cmd_step("c", false, json!([{"type": "any", "step": "d"}])),
            cmd_step("d", false, json!([])),
        ]);
        let plan = parse_plan_document(&doc).unwrap();
        let stage = &plan.stages[0];

        let edges: HashMap<&str, Vec<&str>> = stage
            .steps
            .iter()
            .map(|s| (s.name.as_str(), s.successor_names()))
            .collect();
        let mut colors = HashMap::new();
        for step in &stage.steps {
            assert!(find_cycle(step.name.as_str(), &edges, &mut colors).is_none());
        }
        assert!(stage.init_steps().all(|s| stage.parents_of(&s.name).next().is_none()));
    }
}
