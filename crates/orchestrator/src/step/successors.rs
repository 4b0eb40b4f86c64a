//! Successor edge predicates.

use cryton_core::{KeyPath, StepExecution, StepState, StepTemplate, Successor, SuccessorType};
use serde_json::Value;

/// Whether `edge` holds for the finished `step`.
pub fn edge_matches(edge: &Successor, step: &StepExecution) -> bool {
    match edge.successor_type {
        SuccessorType::Result => edge
            .value
            .as_str()
            .is_some_and(|expected| expected.to_lowercase() == step.result.as_str()),
        SuccessorType::Output => edge
            .value
            .as_str()
            .is_some_and(|needle| step.output.contains(needle)),
        SuccessorType::SerializedOutput => {
            let Some(key) = edge.value.get("key").and_then(Value::as_str) else {
                return false;
            };
            let expected = edge.value.get("value").unwrap_or(&Value::Null);
            KeyPath::parse(key)
                .ok()
                .and_then(|path| path.lookup(&step.serialized_output).cloned())
                .is_some_and(|actual| &actual == expected)
        }
        SuccessorType::Any => true,
    }
}

/// Only steps that ran to a reply or failed take part in successor selection.
pub fn is_completed(state: StepState) -> bool {
    matches!(state, StepState::Finished | StepState::Error)
}

/// Whether `parent` (run from `template`) leads to the step named `target`.
pub fn leads_to(template: &StepTemplate, parent: &StepExecution, target: &str) -> bool {
    is_completed(parent.state) && template.edges_to(target).any(|edge| edge_matches(edge, parent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryton_core::StepResult;
    use serde_json::json;
    use uuid::Uuid;

    fn edge(value: Value) -> Successor {
        serde_json::from_value(value).unwrap()
    }

    fn finished(result: StepResult, output: &str, serialized: Value) -> StepExecution {
        let mut step = StepExecution::new(Uuid::new_v4(), "a");
        step.state = StepState::Finished;
        step.result = result;
        step.output = output.to_string();
        step.serialized_output = serialized;
        step
    }

    #[test]
    fn test_result_edge_is_case_insensitive() {
        let step = finished(StepResult::Ok, "", json!({}));
        assert!(edge_matches(&edge(json!({"type": "result", "value": "OK", "step": "b"})), &step));
        assert!(!edge_matches(&edge(json!({"type": "result", "value": "fail", "step": "b"})), &step));
    }

    #[test]
    fn test_output_edge_is_substring() {
        let step = finished(StepResult::Ok, "22/tcp open ssh", json!({}));
        assert!(edge_matches(&edge(json!({"type": "output", "value": "open ssh", "step": "b"})), &step));
        assert!(!edge_matches(&edge(json!({"type": "output", "value": "closed", "step": "b"})), &step));
    }

    #[test]
    fn test_serialized_output_edge() {
        let step = finished(
            StepResult::Ok,
            "",
            json!({"hosts": [{"ports": [{"port": 22, "state": "open"}]}]}),
        );
        let open = edge(json!({
            "type": "serialized_output",
            "value": {"key": "hosts[0].ports[0].state", "value": "open"},
            "step": "b"
        }));
        let port = edge(json!({
            "type": "serialized_output",
            "value": {"key": "hosts[0]|ports[0]|port", "value": 80},
            "step": "b"
        }));
        let missing = edge(json!({
            "type": "serialized_output",
            "value": {"key": "hosts[1].ports", "value": null},
            "step": "b"
        }));
        assert!(edge_matches(&open, &step));
        assert!(!edge_matches(&port, &step));
        assert!(!edge_matches(&missing, &step));
    }

    #[test]
    fn test_ignored_parent_never_leads() {
        let template: StepTemplate = serde_json::from_value(json!({
            "name": "a",
            "step_type": "worker-execute",
            "next": [{"type": "any", "step": "b"}]
        }))
        .unwrap();
        let mut parent = finished(StepResult::None, "", json!({}));
        assert!(leads_to(&template, &parent, "b"));
        parent.state = StepState::Ignored;
        assert!(!leads_to(&template, &parent, "b"));
        assert!(!leads_to(&template, &finished(StepResult::Ok, "", json!({})), "c"));
    }
}
