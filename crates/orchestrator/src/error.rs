use cryton_core::{EntityKind, ValidationError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid state of {kind} {id}: {state}")]
    InvalidState {
        kind: EntityKind,
        id: Uuid,
        state: String,
    },

    #[error("Invalid {kind} transition for {id} from {from} to {to}")]
    InvalidTransition {
        kind: EntityKind,
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("No reply from worker '{worker}' within {timeout_secs}s")]
    RpcTimeout { worker: String, timeout_secs: u64 },

    #[error("Session is not open: {0}")]
    SessionIsNotOpen(String),

    #[error("Unexpected value: {0}")]
    UnexpectedValue(String),

    #[error("Step execution {0} references $parent but has no parent")]
    MissingParent(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("Bus error: {0}")]
    Bus(bus::BusError),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Dispatch queue is closed")]
    DispatchClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(kind: EntityKind, id: Uuid, state: impl ToString) -> Self {
        Self::InvalidState {
            kind,
            id,
            state: state.to_string(),
        }
    }
}

impl From<bus::BusError> for OrchestratorError {
    fn from(error: bus::BusError) -> Self {
        match error {
            bus::BusError::RpcTimeout {
                queue,
                timeout_secs,
            } => Self::RpcTimeout {
                worker: queue,
                timeout_secs,
            },
            other => Self::Bus(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kinds_are_distinct() {
        let id = Uuid::new_v4();
        let run = OrchestratorError::invalid_state(EntityKind::Run, id, "RUNNING");
        let stage = OrchestratorError::invalid_state(EntityKind::StageExecution, id, "RUNNING");
        assert!(run.to_string().starts_with("Invalid state of run"));
        assert!(stage.to_string().starts_with("Invalid state of stage execution"));
    }

    #[test]
    fn test_rpc_timeout_is_lifted() {
        let error: OrchestratorError = bus::BusError::RpcTimeout {
            queue: "cryton_worker.alpha.control.request".to_string(),
            timeout_secs: 180,
        }
        .into();
        assert!(matches!(error, OrchestratorError::RpcTimeout { timeout_secs: 180, .. }));
    }
}
