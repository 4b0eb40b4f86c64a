use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::trigger::TriggerType;

/// Step kinds a worker (or an Empire agent behind it) can carry out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StepType {
    #[serde(rename = "worker-execute")]
    WorkerExecute,
    #[serde(rename = "empire-execute")]
    EmpireExecute,
    #[serde(rename = "empire-deploy-agent")]
    EmpireDeployAgent,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerExecute => "worker-execute",
            Self::EmpireExecute => "empire-execute",
            Self::EmpireDeployAgent => "empire-deploy-agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "worker-execute" => Some(Self::WorkerExecute),
            "empire-execute" => Some(Self::EmpireExecute),
            "empire-deploy-agent" => Some(Self::EmpireDeployAgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuccessorType {
    Result,
    Output,
    SerializedOutput,
    Any,
}

impl SuccessorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Result => "result",
            Self::Output => "output",
            Self::SerializedOutput => "serialized_output",
            Self::Any => "any",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "result" => Some(Self::Result),
            "output" => Some(Self::Output),
            "serialized_output" => Some(Self::SerializedOutput),
            "any" => Some(Self::Any),
            _ => None,
        }
    }
}

/// Conditional edge from one step to one or more steps of the same stage.
///
/// For `serialized_output` edges `value` is an object `{"key": "<path>", "value": <expected>}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Successor {
    #[serde(rename = "type")]
    pub successor_type: SuccessorType,
    #[serde(default)]
    pub value: Value,
    #[serde(deserialize_with = "one_or_many")]
    pub step: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputMapping {
    pub name_from: String,
    pub name_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepTemplate {
    pub name: String,
    pub step_type: StepType,
    #[serde(default)]
    pub is_init: bool,
    #[serde(default = "empty_object")]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_prefix: Option<String>,
    #[serde(default)]
    pub next: Vec<Successor>,
    #[serde(default)]
    pub output_mapping: Vec<OutputMapping>,
}

impl StepTemplate {
    pub fn is_final(&self) -> bool {
        self.next.is_empty()
    }

    /// Namespace under which later steps reference this step's output.
    pub fn output_prefix(&self) -> &str {
        self.output_prefix.as_deref().unwrap_or(&self.name)
    }

    /// Names of all successor steps, deduplicated, in declaration order.
    pub fn successor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for successor in &self.next {
            for name in &successor.step {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Edges of this step leading to `target`.
    pub fn edges_to<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a Successor> + 'a {
        self.next
            .iter()
            .filter(move |s| s.step.iter().any(|name| name == target))
    }

    pub fn argument_str(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageTemplate {
    pub name: String,
    pub trigger_type: TriggerType,
    #[serde(default = "empty_object")]
    pub trigger_args: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepTemplate>,
}

impl StageTemplate {
    pub fn step(&self, name: &str) -> Option<&StepTemplate> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn init_steps(&self) -> impl Iterator<Item = &StepTemplate> {
        self.steps.iter().filter(|s| s.is_init)
    }

    /// Steps that carry at least one edge to `name`.
    pub fn parents_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a StepTemplate> + 'a {
        self.steps
            .iter()
            .filter(move |s| s.successor_names().contains(&name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanTemplate {
    pub name: String,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub stages: Vec<StageTemplate>,
}

impl PlanTemplate {
    pub fn stage(&self, name: &str) -> Option<&StageTemplate> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn step(&self, stage_name: &str, step_name: &str) -> Option<&StepTemplate> {
        self.stage(stage_name).and_then(|s| s.step(step_name))
    }

    /// Stages whose `depends_on` lists `stage_name`.
    pub fn dependents_of<'a>(&'a self, stage_name: &'a str) -> impl Iterator<Item = &'a StageTemplate> + 'a {
        self.stages
            .iter()
            .filter(move |s| s.depends_on.iter().any(|d| d == stage_name))
    }

    pub fn find_by_output_prefix(&self, prefix: &str) -> Option<(&StageTemplate, &StepTemplate)> {
        self.stages.iter().find_map(|stage| {
            stage
                .steps
                .iter()
                .find(|step| step.output_prefix() == prefix)
                .map(|step| (stage, step))
        })
    }
}

/// A stored, validated plan template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub dynamic: bool,
    pub template: PlanTemplate,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(template: PlanTemplate) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: template.name.clone(),
            dynamic: template.dynamic,
            template,
            created_at: Utc::now(),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(name) => vec![name],
        OneOrMany::Many(names) => names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(value: Value) -> StepTemplate {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_output_prefix_defaults_to_name() {
        let s = step(json!({"name": "scan", "step_type": "worker-execute"}));
        assert_eq!(s.output_prefix(), "scan");
        assert!(s.is_final());

        let s = step(json!({"name": "scan", "step_type": "worker-execute", "output_prefix": "custom"}));
        assert_eq!(s.output_prefix(), "custom");
    }

    #[test]
    fn test_successor_accepts_single_and_list() {
        let s = step(json!({
            "name": "a",
            "step_type": "worker-execute",
            "next": [
                {"type": "result", "value": "ok", "step": "b"},
                {"type": "any", "step": ["c", "b"]}
            ]
        }));
        assert_eq!(s.successor_names(), vec!["b", "c"]);
        assert_eq!(s.edges_to("b").count(), 2);
        assert_eq!(s.edges_to("c").count(), 1);
    }

    #[test]
    fn test_parents_of() {
        let stage: StageTemplate = serde_json::from_value(json!({
            "name": "s",
            "trigger_type": "delta",
            "steps": [
                {"name": "a", "step_type": "worker-execute", "is_init": true,
                 "next": [{"type": "any", "step": "c"}]},
                {"name": "b", "step_type": "worker-execute", "is_init": true,
                 "next": [{"type": "any", "step": "c"}]},
                {"name": "c", "step_type": "worker-execute"}
            ]
        }))
        .unwrap();

        let parents: Vec<&str> = stage.parents_of("c").map(|s| s.name.as_str()).collect();
        assert_eq!(parents, vec!["a", "b"]);
        assert_eq!(stage.init_steps().count(), 2);
    }

    #[test]
    fn test_step_type_parsing() {
        assert_eq!(StepType::parse("empire-deploy-agent"), Some(StepType::EmpireDeployAgent));
        assert_eq!(StepType::parse("nope"), None);
        assert_eq!(SuccessorType::parse("serialized_output"), Some(SuccessorType::SerializedOutput));
    }
}
