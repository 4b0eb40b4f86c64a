use cryton_core::{CorrelationEvent, ExecutionVariable, Session};
use serde_json::Value;

use super::{datetime_to_millis, millis_to_datetime, parse_id};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CorrelationEventRow {
    pub correlation_id: String,
    pub step_execution_id: String,
    pub created_at: i64,
}

impl CorrelationEventRow {
    pub fn into_domain(self) -> CorrelationEvent {
        CorrelationEvent {
            correlation_id: self.correlation_id,
            step_execution_id: parse_id(&self.step_execution_id),
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

impl From<&CorrelationEvent> for CorrelationEventRow {
    fn from(event: &CorrelationEvent) -> Self {
        Self {
            correlation_id: event.correlation_id.clone(),
            step_execution_id: event.step_execution_id.to_string(),
            created_at: datetime_to_millis(event.created_at),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub plan_execution_id: String,
    pub name: Option<String>,
    pub worker_session_id: String,
    pub created_at: i64,
}

impl SessionRow {
    pub fn into_domain(self) -> Session {
        Session {
            id: parse_id(&self.id),
            plan_execution_id: parse_id(&self.plan_execution_id),
            name: self.name,
            worker_session_id: self.worker_session_id,
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

impl From<&Session> for SessionRow {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.to_string(),
            plan_execution_id: session.plan_execution_id.to_string(),
            name: session.name.clone(),
            worker_session_id: session.worker_session_id.clone(),
            created_at: datetime_to_millis(session.created_at),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionVariableRow {
    pub id: String,
    pub plan_execution_id: String,
    pub name: String,
    pub value: String,
}

impl ExecutionVariableRow {
    pub fn into_domain(self) -> ExecutionVariable {
        // Values are stored as JSON; anything else is kept as a plain string.
        let value = serde_json::from_str(&self.value).unwrap_or(Value::String(self.value));
        ExecutionVariable {
            id: parse_id(&self.id),
            plan_execution_id: parse_id(&self.plan_execution_id),
            name: self.name,
            value,
        }
    }
}

impl From<&ExecutionVariable> for ExecutionVariableRow {
    fn from(variable: &ExecutionVariable) -> Self {
        Self {
            id: variable.id.to_string(),
            plan_execution_id: variable.plan_execution_id.to_string(),
            name: variable.name.clone(),
            value: variable.value.to_string(),
        }
    }
}
