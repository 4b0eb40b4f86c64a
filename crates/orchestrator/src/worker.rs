//! Worker addressing, control-plane RPCs and liveness.

use std::sync::Arc;

use bus::{BusClient, BusError, EventEnvelope, WorkerQueues};
use cryton_core::{EntityKind, Worker, WorkerState};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::HiveContext;
use crate::error::{OrchestratorError, Result};

/// Control events understood by workers.
pub mod events {
    pub const HEALTH_CHECK: &str = "health_check";
    pub const LIST_MODULES: &str = "list_modules";
    pub const LIST_SESSIONS: &str = "list_sessions";
    pub const LIST_TRIGGERS: &str = "list_triggers";
    pub const VALIDATE_MODULE: &str = "validate_module";
    pub const KILL_STEP_EXECUTION: &str = "kill_step_execution";
    pub const ADD_TRIGGER: &str = "add_trigger";
    pub const REMOVE_TRIGGER: &str = "remove_trigger";
}

/// Control-queue client for one worker.
#[derive(Clone)]
pub struct WorkerClient {
    bus: BusClient,
    name: String,
    queues: WorkerQueues,
}

impl WorkerClient {
    pub fn new(bus: BusClient, worker: &Worker) -> Self {
        Self {
            bus,
            name: worker.name.clone(),
            queues: WorkerQueues::for_worker(&worker.name),
        }
    }

    pub fn queues(&self) -> &WorkerQueues {
        &self.queues
    }

    pub async fn declare_queues(&self) -> Result<()> {
        let broker = self.bus.broker();
        for queue in [&self.queues.attack, &self.queues.agent, &self.queues.control] {
            broker.declare_queue(queue).await?;
        }
        Ok(())
    }

    async fn request(&self, event_t: &str, event_v: Value) -> Result<EventEnvelope> {
        let body = EventEnvelope::new(event_t, event_v);
        let reply = self
            .bus
            .rpc_call(&self.queues.control, &body)
            .await
            .map_err(|e| match e {
                BusError::RpcTimeout { timeout_secs, .. } => OrchestratorError::RpcTimeout {
                    worker: self.name.clone(),
                    timeout_secs,
                },
                other => other.into(),
            })?;
        let envelope: EventEnvelope = serde_json::from_value(reply)?;
        debug!(
            worker = %self.name,
            event = event_t,
            return_code = ?envelope.return_code(),
            "Control reply received"
        );
        Ok(envelope)
    }

    pub async fn health_check(&self) -> Result<bool> {
        Ok(self.request(events::HEALTH_CHECK, json!({})).await?.is_ok())
    }

    pub async fn list_modules(&self) -> Result<Value> {
        let reply = self.request(events::LIST_MODULES, json!({})).await?;
        Ok(reply.event_v.get("module_list").cloned().unwrap_or(Value::Array(Vec::new())))
    }

    pub async fn list_triggers(&self) -> Result<Value> {
        let reply = self.request(events::LIST_TRIGGERS, json!({})).await?;
        Ok(reply.event_v.get("trigger_list").cloned().unwrap_or(Value::Array(Vec::new())))
    }

    /// Ids of open sessions, optionally only those to `target`.
    pub async fn list_sessions(&self, target: Option<&str>) -> Result<Vec<String>> {
        let event_v = match target {
            Some(target) => json!({"target_ip": target}),
            None => json!({}),
        };
        let reply = self.request(events::LIST_SESSIONS, event_v).await?;
        let sessions = reply
            .event_v
            .get("session_list")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(session_id_of).collect())
            .unwrap_or_default();
        Ok(sessions)
    }

    /// Returns whether the module accepted the arguments, with the worker's output.
    pub async fn validate_module(&self, module: &str, module_arguments: &Value) -> Result<(bool, String)> {
        let reply = self
            .request(
                events::VALIDATE_MODULE,
                json!({"module": module, "module_arguments": module_arguments}),
            )
            .await?;
        let output = reply.value_str("output").unwrap_or_default().to_string();
        Ok((reply.is_ok(), output))
    }

    pub async fn kill_step_execution(&self, correlation_id: &str) -> Result<EventEnvelope> {
        self.request(
            events::KILL_STEP_EXECUTION,
            json!({"correlation_id": correlation_id}),
        )
        .await
    }

    pub async fn add_trigger(&self, arguments: Value) -> Result<EventEnvelope> {
        self.request(events::ADD_TRIGGER, arguments).await
    }

    pub async fn remove_trigger(&self, trigger_id: &str) -> Result<EventEnvelope> {
        self.request(events::REMOVE_TRIGGER, json!({"trigger_id": trigger_id}))
            .await
    }
}

/// Session ids arrive as strings or numbers.
pub(crate) fn session_id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Registry of workers known to the hive.
#[derive(Clone)]
pub struct WorkerService {
    ctx: Arc<HiveContext>,
}

impl WorkerService {
    pub fn new(ctx: Arc<HiveContext>) -> Self {
        Self { ctx }
    }

    pub fn client(&self, worker: &Worker) -> WorkerClient {
        WorkerClient::new(self.ctx.bus.clone(), worker)
    }

    pub async fn register(&self, name: &str, description: &str) -> Result<Worker> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::UnexpectedValue(
                "worker name must not be empty".to_string(),
            ));
        }
        if self.ctx.store.workers.find_by_name(name).await?.is_some() {
            return Err(OrchestratorError::UnexpectedValue(format!(
                "worker '{name}' already exists"
            )));
        }
        let worker = self.ctx.store.workers.create(&Worker::new(name, description)).await?;
        info!(worker_id = %worker.id, worker = %worker.name, "Worker registered");
        Ok(worker)
    }

    pub async fn get(&self, id: Uuid) -> Result<Worker> {
        self.ctx.load_worker(id).await
    }

    pub async fn list(&self) -> Result<Vec<Worker>> {
        Ok(self.ctx.store.workers.find_all().await?)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        if !self.ctx.store.workers.delete(id).await? {
            return Err(OrchestratorError::not_found(EntityKind::Worker, id));
        }
        info!(worker_id = %id, "Worker deleted");
        Ok(())
    }

    /// Probes the worker and records it as UP or DOWN.
    pub async fn health_check(&self, id: Uuid) -> Result<WorkerState> {
        let worker = self.ctx.load_worker(id).await?;
        let state = match self.client(&worker).health_check().await {
            Ok(true) => WorkerState::Up,
            Ok(false) => WorkerState::Down,
            Err(e) => {
                warn!(worker = %worker.name, error = %e, "Health check failed");
                WorkerState::Down
            }
        };
        self.ctx.store.workers.update_state(id, state).await?;
        info!(worker = %worker.name, state = state.as_str(), "Worker health checked");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids() {
        assert_eq!(session_id_of(&json!("4")), Some("4".to_string()));
        assert_eq!(session_id_of(&json!(12)), Some("12".to_string()));
        assert_eq!(session_id_of(&json!("")), None);
        assert_eq!(session_id_of(&json!({"id": 1})), None);
    }
}
