//! Argument resolution at dispatch time.
//!
//! Two passes over a step's argument tree: `{{ name }}` execution variables,
//! then `$prefix.key[0]` (or `$prefix|key[0]`) references into the serialized
//! output of earlier steps. A placeholder spanning a whole string is replaced
//! by the value itself, keeping its type; an embedded one is stringified.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use cryton_core::{KeyPath, Plan, StageExecution, StepExecution, PARENT_PREFIX};
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::warn;

use crate::context::HiveContext;
use crate::error::{OrchestratorError, Result};

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("Invalid variable regex pattern")
    })
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$([A-Za-z_][A-Za-z0-9_\-]*)((?:[.|][A-Za-z0-9_\-]+|\[[0-9]+\])+)")
            .expect("Invalid reference regex pattern")
    })
}

/// Resolves `arguments` for `step`, reading variables and referenced outputs
/// from the store.
pub async fn resolve_arguments(
    ctx: &HiveContext,
    plan: &Plan,
    stage: &StageExecution,
    step: &StepExecution,
    arguments: &Value,
) -> Result<Value> {
    let variables: HashMap<String, Value> = ctx
        .store
        .variables
        .find_by_plan_execution(stage.plan_execution_id)
        .await?
        .into_iter()
        .map(|v| (v.name, v.value))
        .collect();
    let resolved = apply_variables(arguments, &expand_variables(&variables));

    let prefixes = collect_reference_prefixes(&resolved);
    if prefixes.is_empty() {
        return Ok(resolved);
    }

    let mut outputs = HashMap::new();
    for prefix in prefixes {
        match load_output(ctx, plan, stage, step, &prefix).await? {
            Some(output) => {
                outputs.insert(prefix, output);
            }
            None => warn!(
                step_execution_id = %step.id,
                prefix = %prefix,
                "Reference does not match any step output, leaving it unchanged"
            ),
        }
    }
    Ok(apply_references(&resolved, &outputs))
}

async fn load_output(
    ctx: &HiveContext,
    plan: &Plan,
    stage: &StageExecution,
    step: &StepExecution,
    prefix: &str,
) -> Result<Option<Value>> {
    if prefix == PARENT_PREFIX {
        let parent_id = step
            .parent_id
            .ok_or(OrchestratorError::MissingParent(step.id))?;
        return Ok(Some(ctx.load_step(parent_id).await?.serialized_output));
    }

    let Some((source_stage, source_step)) = plan.template.find_by_output_prefix(prefix) else {
        return Ok(None);
    };
    let stage_execution_id = if source_stage.name == stage.stage_name {
        stage.id
    } else {
        match ctx
            .store
            .stage_executions
            .find_by_name(stage.plan_execution_id, &source_stage.name)
            .await?
        {
            Some(source) => source.id,
            None => return Ok(None),
        }
    };
    Ok(ctx
        .store
        .step_executions
        .find_by_name(stage_execution_id, &source_step.name)
        .await?
        .map(|s| s.serialized_output))
}

/// Expands variables that refer to other variables. A variable that still
/// mentions a defined variable afterwards depends on a cycle and is dropped,
/// so it resolves as undefined.
pub fn expand_variables(variables: &HashMap<String, Value>) -> HashMap<String, Value> {
    let mut expanded = variables.clone();
    for _ in 0..=variables.len() {
        let next: HashMap<String, Value> = expanded
            .iter()
            .map(|(name, value)| (name.clone(), apply_variables(value, &expanded)))
            .collect();
        if next == expanded {
            break;
        }
        expanded = next;
    }

    expanded.retain(|_, value| !mentions_any(value, variables));
    expanded
}

fn mentions_any(value: &Value, variables: &HashMap<String, Value>) -> bool {
    match value {
        Value::String(text) => variable_pattern()
            .captures_iter(text)
            .any(|caps| variables.contains_key(&caps[1])),
        Value::Array(items) => items.iter().any(|v| mentions_any(v, variables)),
        Value::Object(map) => map.values().any(|v| mentions_any(v, variables)),
        _ => false,
    }
}

pub fn apply_variables(value: &Value, variables: &HashMap<String, Value>) -> Value {
    map_strings(value, &|text| {
        substitute(text, variable_pattern(), |caps| variables.get(&caps[1]).cloned())
    })
}

/// Prefixes of all `$prefix…` references in the tree.
pub fn collect_reference_prefixes(value: &Value) -> BTreeSet<String> {
    let mut prefixes = BTreeSet::new();
    collect_prefixes(value, &mut prefixes);
    prefixes
}

fn collect_prefixes(value: &Value, prefixes: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => {
            for caps in reference_pattern().captures_iter(text) {
                prefixes.insert(caps[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_prefixes(v, prefixes)),
        Value::Object(map) => map.values().for_each(|v| collect_prefixes(v, prefixes)),
        _ => {}
    }
}

/// Replaces references whose prefix has an entry in `outputs` and whose key
/// path resolves. Anything else is left as written.
pub fn apply_references(value: &Value, outputs: &HashMap<String, Value>) -> Value {
    map_strings(value, &|text| {
        substitute(text, reference_pattern(), |caps| {
            let output = outputs.get(&caps[1])?;
            match KeyPath::parse(&caps[2]) {
                Ok(path) => path.lookup(output).cloned(),
                Err(e) => {
                    warn!(reference = %&caps[0], error = %e, "Invalid reference key path");
                    None
                }
            }
        })
    })
}

fn map_strings(value: &Value, f: &dyn Fn(&str) -> Value) -> Value {
    match value {
        Value::String(text) => f(text),
        Value::Array(items) => Value::Array(items.iter().map(|v| map_strings(v, f)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), map_strings(v, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute(text: &str, pattern: &Regex, lookup: impl Fn(&Captures) -> Option<Value>) -> Value {
    if let Some(caps) = pattern.captures(text) {
        if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == text.len()) {
            if let Some(value) = lookup(&caps) {
                return value;
            }
        }
    }

    let replaced = pattern.replace_all(text, |caps: &Captures| match lookup(caps) {
        Some(value) => stringify(&value),
        None => caps[0].to_string(),
    });
    Value::String(replaced.into_owned())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_variables_keep_type_when_whole() {
        let variables = vars(json!({"port": 22, "target": "10.0.0.1"}));
        let args = json!({
            "module": "nmap",
            "module_arguments": {
                "ports": "{{ port }}",
                "target": "{{target}}",
                "cmd": "ping -c 1 {{ target }}:{{ port }}"
            }
        });
        let resolved = apply_variables(&args, &expand_variables(&variables));
        assert_eq!(resolved["module_arguments"]["ports"], json!(22));
        assert_eq!(resolved["module_arguments"]["target"], json!("10.0.0.1"));
        assert_eq!(resolved["module_arguments"]["cmd"], json!("ping -c 1 10.0.0.1:22"));
    }

    #[test]
    fn test_undefined_variable_is_left_unchanged() {
        let args = json!({"cmd": "echo {{ missing }}", "whole": "{{missing}}"});
        let resolved = apply_variables(&args, &HashMap::new());
        assert_eq!(resolved, args);
    }

    #[test]
    fn test_chained_and_cyclic_variables() {
        let variables = vars(json!({
            "host": "{{ ip }}",
            "ip": "10.0.0.5",
            "a": "{{ b }}",
            "b": "{{ a }}"
        }));
        let expanded = expand_variables(&variables);
        assert_eq!(expanded["host"], json!("10.0.0.5"));
        assert!(!expanded.contains_key("a"));
        assert!(!expanded.contains_key("b"));

        let resolved = apply_variables(&json!("{{ a }} {{ host }}"), &expanded);
        assert_eq!(resolved, json!("{{ a }} 10.0.0.5"));
    }

    #[test]
    fn test_variable_resolution_is_idempotent() {
        let variables = vars(json!({
            "user": "admin",
            "creds": {"user": "{{ user }}", "pass": "{{ secret }}"},
            "loop": "{{ loop }}",
            "list": [1, "{{ user }}"]
        }));
        let expanded = expand_variables(&variables);
        let trees = [
            json!({"a": "{{ creds }}", "b": ["{{user}}", "x {{ list }} y"]}),
            json!("{{ loop }} and {{ user }}"),
            json!({"nested": {"deep": ["{{ secret }}", 5, null, true]}}),
            json!(42),
        ];
        for tree in trees {
            let once = apply_variables(&tree, &expanded);
            let twice = apply_variables(&once, &expand_variables(&variables));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_reference_prefixes() {
        let args = json!({
            "user": "$custom.username",
            "list": ["$parent.credentials[0].password", "$scan|ports[1]"],
            "plain": "$HOME/bin"
        });
        let prefixes: Vec<String> = collect_reference_prefixes(&args).into_iter().collect();
        assert_eq!(prefixes, vec!["custom", "parent", "scan"]);
    }

    #[test]
    fn test_references_resolve_with_type() {
        let outputs: HashMap<String, Value> = [
            ("custom".to_string(), json!({"username": "u", "ports": [22, 80]})),
            ("parent".to_string(), json!({"credentials": [{"password": "p"}]})),
        ]
        .into_iter()
        .collect();

        let args = json!({
            "user": "$custom.username",
            "ports": "$custom.ports",
            "first": "$custom|ports[0]",
            "password": "$parent.credentials[0].password",
            "cmd": "login $custom.username:$parent.credentials[0].password on $custom.ports"
        });
        let resolved = apply_references(&args, &outputs);
        assert_eq!(resolved["user"], json!("u"));
        assert_eq!(resolved["ports"], json!([22, 80]));
        assert_eq!(resolved["first"], json!(22));
        assert_eq!(resolved["password"], json!("p"));
        assert_eq!(resolved["cmd"], json!("login u:p on [22,80]"));
    }

    #[test]
    fn test_unresolvable_references_are_left_unchanged() {
        let outputs: HashMap<String, Value> =
            [("custom".to_string(), json!({"username": "u"}))].into_iter().collect();
        let args = json!({
            "missing_key": "$custom.password",
            "unknown_prefix": "$other.username",
            "mixed": "$custom.a|b"
        });
        assert_eq!(apply_references(&args, &outputs), args);
    }
}
