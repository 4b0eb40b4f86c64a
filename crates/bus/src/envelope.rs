//! JSON bodies exchanged with workers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RETURN_CODE_OK: i64 = 0;
pub const RETURN_CODE_FAIL: i64 = -1;
/// Engine-level or module-configuration failure.
pub const RETURN_CODE_ERROR: i64 = -2;
/// The step was interrupted by a kill request.
pub const RETURN_CODE_TERMINATED: i64 = -3;

/// Events and control requests: `{event_t, event_v}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub event_t: String,
    #[serde(default = "empty_object")]
    pub event_v: Value,
}

impl EventEnvelope {
    pub fn new(event_t: impl Into<String>, event_v: Value) -> Self {
        Self {
            event_t: event_t.into(),
            event_v,
        }
    }

    /// `event_v.return_code` of a control reply.
    pub fn return_code(&self) -> Option<i64> {
        self.event_v.get("return_code").and_then(Value::as_i64)
    }

    pub fn is_ok(&self) -> bool {
        self.return_code() == Some(RETURN_CODE_OK)
    }

    pub fn value_str(&self, key: &str) -> Option<&str> {
        self.event_v.get(key).and_then(Value::as_str)
    }
}

/// Step dispatch body sent to a worker's attack or agent queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDispatch {
    pub step_type: String,
    pub arguments: Value,
    /// Queue the worker answers on; mirrors the `reply_to` property.
    pub ack_queue: String,
}

/// Worker reply to a step dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepReply {
    pub return_code: i64,
    #[serde(default)]
    pub output: String,
    #[serde(default = "empty_object")]
    pub serialized_output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_out: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_err: Option<String>,
}

impl StepReply {
    pub fn ok(output: impl Into<String>, serialized_output: Value) -> Self {
        Self {
            return_code: RETURN_CODE_OK,
            output: output.into(),
            serialized_output,
            std_out: None,
            std_err: None,
        }
    }

    pub fn with_return_code(mut self, return_code: i64) -> Self {
        self.return_code = return_code;
        self
    }

    /// Textual output: `output`, falling back to captured stdout/stderr.
    pub fn combined_output(&self) -> String {
        if !self.output.is_empty() {
            return self.output.clone();
        }
        [self.std_out.as_deref(), self.std_err.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_defaults() {
        let reply: StepReply = serde_json::from_value(json!({"return_code": -1})).unwrap();
        assert_eq!(reply.return_code, RETURN_CODE_FAIL);
        assert!(reply.output.is_empty());
        assert_eq!(reply.serialized_output, json!({}));
    }

    #[test]
    fn test_combined_output() {
        let reply: StepReply = serde_json::from_value(json!({
            "return_code": 0,
            "std_out": "hi",
            "std_err": ""
        }))
        .unwrap();
        assert_eq!(reply.combined_output(), "hi");
    }

    #[test]
    fn test_control_reply_return_code() {
        let reply: EventEnvelope = serde_json::from_value(json!({
            "event_t": "HEALTH_CHECK",
            "event_v": {"return_code": 0}
        }))
        .unwrap();
        assert!(reply.is_ok());

        let event: EventEnvelope =
            serde_json::from_value(json!({"event_t": "trigger_stage"})).unwrap();
        assert_eq!(event.return_code(), None);
    }
}
