//! Metasploit sessions requested by step arguments.

use cryton_core::Session;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::HiveContext;
use crate::error::{OrchestratorError, Result};
use crate::worker::{session_id_of, WorkerClient};

/// Worker-side id of the session a step asked for, if it asked for one.
pub async fn resolve_session(
    ctx: &HiveContext,
    worker: &WorkerClient,
    plan_execution_id: Uuid,
    arguments: &Value,
) -> Result<Option<String>> {
    if let Some(name) = arguments.get("use_named_session").and_then(Value::as_str) {
        let session = ctx
            .store
            .sessions
            .find_by_name(plan_execution_id, name)
            .await?
            .ok_or_else(|| OrchestratorError::SessionIsNotOpen(name.to_string()))?;
        debug!(session = name, worker_session_id = %session.worker_session_id, "Using named session");
        return Ok(Some(session.worker_session_id));
    }

    if let Some(target) = arguments
        .get("use_any_session_to_target")
        .and_then(Value::as_str)
    {
        let sessions = worker.list_sessions(Some(target)).await?;
        let session_id = sessions
            .last()
            .cloned()
            .ok_or_else(|| OrchestratorError::SessionIsNotOpen(target.to_string()))?;
        debug!(target, worker_session_id = %session_id, "Using session to target");
        return Ok(Some(session_id));
    }

    Ok(None)
}

/// Stores the session a finished step opened under the name it declared.
pub async fn register_named_session(
    ctx: &HiveContext,
    plan_execution_id: Uuid,
    name: &str,
    serialized_output: &Value,
) -> Result<Option<Session>> {
    let Some(worker_session_id) = serialized_output.get("session_id").and_then(session_id_of) else {
        warn!(
            plan_execution_id = %plan_execution_id,
            session = name,
            "Step declared a named session but returned no session id"
        );
        return Ok(None);
    };

    let session = ctx
        .store
        .sessions
        .upsert(&Session::new(
            plan_execution_id,
            Some(name.to_string()),
            worker_session_id,
        ))
        .await?;
    info!(
        plan_execution_id = %plan_execution_id,
        session = name,
        worker_session_id = %session.worker_session_id,
        "Named session registered"
    );
    Ok(Some(session))
}
